//! Cluster access used by the coupler
//!
//! Everything the coupler reads or writes goes through [`CouplingClient`] so
//! reconcile logic can be tested against mocks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use integration_common::crd::{Interface, Plug, PlugStatus, Socket, SocketStatus};
use integration_common::kube_utils::{
    add_finalizer, get_optional, patch_resource_status, remove_finalizer,
};
use integration_common::{Error, FINALIZER};

use crate::bus::Side;

/// Trait abstracting Kubernetes operations for plugs and sockets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CouplingClient: Send + Sync {
    /// Get a Plug
    async fn get_plug(&self, name: &str, namespace: &str) -> Result<Option<Plug>, Error>;

    /// Get a Socket
    async fn get_socket(&self, name: &str, namespace: &str) -> Result<Option<Socket>, Error>;

    /// Get an Interface
    async fn get_interface(&self, name: &str, namespace: &str)
        -> Result<Option<Interface>, Error>;

    /// Patch a Plug's status, returning the updated Plug
    ///
    /// A stale `resource_version` fails with [`Error::Conflict`].
    async fn patch_plug_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &PlugStatus,
    ) -> Result<Plug, Error>;

    /// Patch a Socket's status, returning the updated Socket
    async fn patch_socket_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &SocketStatus,
    ) -> Result<Socket, Error>;

    /// Add the operator finalizer
    async fn add_finalizer(&self, side: Side, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the operator finalizer
    async fn remove_finalizer(&self, side: Side, name: &str, namespace: &str)
        -> Result<(), Error>;

    /// Decoded data of a Secret; `None` when it does not exist
    async fn get_secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Data of a ConfigMap; `None` when it does not exist
    async fn get_config_map_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeCouplingClient {
    client: Client,
}

impl KubeCouplingClient {
    /// Create a new KubeCouplingClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CouplingClient for KubeCouplingClient {
    async fn get_plug(&self, name: &str, namespace: &str) -> Result<Option<Plug>, Error> {
        get_optional(&self.client, name, namespace).await
    }

    async fn get_socket(&self, name: &str, namespace: &str) -> Result<Option<Socket>, Error> {
        get_optional(&self.client, name, namespace).await
    }

    async fn get_interface(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Interface>, Error> {
        get_optional(&self.client, name, namespace).await
    }

    async fn patch_plug_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &PlugStatus,
    ) -> Result<Plug, Error> {
        patch_resource_status(&self.client, name, namespace, resource_version.as_deref(), status)
            .await
    }

    async fn patch_socket_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &SocketStatus,
    ) -> Result<Socket, Error> {
        patch_resource_status(&self.client, name, namespace, resource_version.as_deref(), status)
            .await
    }

    async fn add_finalizer(&self, side: Side, name: &str, namespace: &str) -> Result<(), Error> {
        match side {
            Side::Plug => add_finalizer::<Plug>(&self.client, name, namespace, FINALIZER).await,
            Side::Socket => {
                add_finalizer::<Socket>(&self.client, name, namespace, FINALIZER).await
            }
        }
    }

    async fn remove_finalizer(
        &self,
        side: Side,
        name: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        match side {
            Side::Plug => remove_finalizer::<Plug>(&self.client, name, namespace, FINALIZER).await,
            Side::Socket => {
                remove_finalizer::<Socket>(&self.client, name, namespace, FINALIZER).await
            }
        }
    }

    async fn get_secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let Some(secret) = get_optional::<Secret>(&self.client, name, namespace).await? else {
            return Ok(None);
        };
        Ok(Some(secret_data(&secret)))
    }

    async fn get_config_map_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let Some(config_map) = get_optional::<ConfigMap>(&self.client, name, namespace).await?
        else {
            return Ok(None);
        };
        Ok(Some(config_map.data.unwrap_or_default()))
    }
}

/// Secret values as strings, merging `stringData` over decoded `data`
///
/// Binary values that are not UTF-8 are kept base64 encoded.
pub fn secret_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| {
            let value = String::from_utf8(v.0.clone()).unwrap_or_else(|_| STANDARD.encode(&v.0));
            (k.clone(), value)
        })
        .collect();
    if let Some(string_data) = &secret.string_data {
        out.extend(string_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}
