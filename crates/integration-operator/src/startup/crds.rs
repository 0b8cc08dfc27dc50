//! CRD installation utilities
//!
//! The operator installs its own CRDs on startup using server-side apply, so
//! the CRD versions always match the operator version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use integration_common::crd::{DeferredResource, Interface, Plug, Socket};
use integration_common::FIELD_MANAGER;

/// CRD definition with name and resource
pub struct CrdDef {
    /// Full CRD name (`<plural>.<group>`)
    pub name: &'static str,
    /// Generated definition
    pub crd: CustomResourceDefinition,
}

/// Every CRD the operator serves
pub fn all_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "interfaces.integration.rock8s.com",
            crd: Interface::crd(),
        },
        CrdDef {
            name: "sockets.integration.rock8s.com",
            crd: Socket::crd(),
        },
        CrdDef {
            name: "plugs.integration.rock8s.com",
            crd: Plug::crd(),
        },
        CrdDef {
            name: "deferredresources.integration.rock8s.com",
            crd: DeferredResource::crd(),
        },
    ]
}

/// Install or update all CRDs
pub async fn ensure_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in all_crds() {
        tracing::info!(crd = def.name, "installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}
