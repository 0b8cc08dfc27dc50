//! Plug CRD types
//!
//! A `Plug` consumes a capability exposed by a `Socket`. It names the socket
//! it wants to couple to and carries the config and result sources exchanged
//! with it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{CoupledRef, NamespacedName};
use super::sources::CouplingSources;
use super::types::{Condition, Phase};

/// Desired state of a Plug
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "integration.rock8s.com",
    version = "v1beta1",
    kind = "Plug",
    plural = "plugs",
    namespaced,
    status = "PlugStatus",
    printcolumn = r#"{"name":"Socket","type":"string","jsonPath":".spec.socket.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlugSpec {
    /// Socket to couple to; namespace defaults to the plug's
    pub socket: NamespacedName,

    /// Interface the plug expects the socket to implement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<NamespacedName>,

    /// Data, config, result and resource sources
    #[serde(flatten)]
    pub sources: CouplingSources,
}

/// Results resolved for both sides of a coupling
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoupledResultStatus {
    /// Plug result
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plug: BTreeMap<String, String>,
    /// Socket result
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub socket: BTreeMap<String, String>,
    /// Plug generation the results were computed for
    #[serde(default)]
    pub observed_generation: i64,
}

/// Observed state of a Plug
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlugStatus {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,
    /// Latest observations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Socket this plug is coupled to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupled_socket: Option<CoupledRef>,
    /// Results exchanged on the last successful pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupled_result: Option<CoupledResultStatus>,
}

impl Plug {
    /// Reference to the target socket with its namespace resolved
    pub fn socket_ref(&self) -> NamespacedName {
        let own = self.metadata.namespace.as_deref().unwrap_or("default");
        NamespacedName::new(
            self.spec.socket.name.clone(),
            Some(self.spec.socket.namespace_or(own).to_string()),
        )
    }
}
