//! DeferredResource CRD types
//!
//! A `DeferredResource` holds back a manifest until a timeout has elapsed and
//! every object in `waitFor` exists.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{preserve_unknown_fields, Target};
use super::types::Condition;

/// Desired state of a DeferredResource
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "integration.rock8s.com",
    version = "v1beta1",
    kind = "DeferredResource",
    plural = "deferredresources",
    shortname = "dr",
    namespaced,
    status = "DeferredResourceStatus",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeferredResourceSpec {
    /// Seconds after creation before the resource may be applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    /// Objects that must exist first; namespace defaults to the deferred resource's
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<Target>,

    /// Manifest to apply
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub resource: serde_json::Value,

    /// ServiceAccount used to apply the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Observed state of a DeferredResource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeferredResourceStatus {
    /// Latest observations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Identity of the applied object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_reference: Option<OwnerReference>,
}
