//! Socket CRD types
//!
//! A `Socket` provides a capability that plugs couple to. It validates the
//! namespaces plugs may come from and caps how many may couple at once.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{CoupledRef, NamespacedName};
use super::sources::CouplingSources;
use super::types::Condition;

/// Desired state of a Socket
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "integration.rock8s.com",
    version = "v1beta1",
    kind = "Socket",
    plural = "sockets",
    namespaced,
    status = "SocketStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SocketSpec {
    /// Interface plugs are validated against; namespace defaults to the operator's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<NamespacedName>,

    /// Maximum number of coupled plugs; 0 means unlimited
    #[serde(default)]
    pub limit: u32,

    /// Namespaces plugs may couple from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<SocketValidation>,

    /// Data, config, result and resource sources
    #[serde(flatten)]
    pub sources: CouplingSources,
}

/// Namespace allow/deny list
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SocketValidation {
    /// Only these namespaces may couple when non-empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_whitelist: Vec<String>,
    /// These namespaces may never couple
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_blacklist: Vec<String>,
}

impl SocketValidation {
    /// Whether a plug from `namespace` may couple
    pub fn allows(&self, namespace: &str) -> bool {
        if self.namespace_blacklist.iter().any(|ns| ns == namespace) {
            return false;
        }
        self.namespace_whitelist.is_empty()
            || self.namespace_whitelist.iter().any(|ns| ns == namespace)
    }
}

/// Observed state of a Socket
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SocketStatus {
    /// Latest observations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Plugs coupled to this socket
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coupled_plugs: Vec<CoupledRef>,
    /// Whether plugs may couple
    #[serde(default)]
    pub ready: bool,
    /// Generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl SocketStatus {
    /// Whether a plug with `uid` is in the coupled set
    pub fn has_plug(&self, uid: &str) -> bool {
        self.coupled_plugs.iter().any(|p| p.uid == uid)
    }

    /// Add a plug unless already present; returns whether it was added
    pub fn insert_plug(&mut self, plug: CoupledRef) -> bool {
        if self.has_plug(&plug.uid) {
            return false;
        }
        self.coupled_plugs.push(plug);
        true
    }

    /// Remove a plug by uid; returns whether it was present
    pub fn remove_plug(&mut self, uid: &str) -> bool {
        let before = self.coupled_plugs.len();
        self.coupled_plugs.retain(|p| p.uid != uid);
        before != self.coupled_plugs.len()
    }
}

/// Message for the socket's Joined condition
pub fn coupled_plugs_message(count: usize) -> String {
    if count == 1 {
        "1 plug coupled".to_string()
    } else {
        format!("{} plugs coupled", count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plug_ref(name: &str, uid: &str) -> CoupledRef {
        CoupledRef {
            api_version: "integration.rock8s.com/v1beta1".to_string(),
            kind: "Plug".to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: uid.to_string(),
        }
    }

    #[test]
    fn test_coupled_set_is_idempotent() {
        let mut status = SocketStatus::default();
        assert!(status.insert_plug(plug_ref("app", "uid-1")));
        assert!(!status.insert_plug(plug_ref("app", "uid-1")));
        assert_eq!(status.coupled_plugs.len(), 1);

        assert!(status.remove_plug("uid-1"));
        assert!(!status.remove_plug("uid-1"));
        assert!(status.coupled_plugs.is_empty());
    }

    #[test]
    fn test_namespace_validation() {
        let open = SocketValidation::default();
        assert!(open.allows("anything"));

        let whitelist = SocketValidation {
            namespace_whitelist: vec!["apps".to_string()],
            ..Default::default()
        };
        assert!(whitelist.allows("apps"));
        assert!(!whitelist.allows("other"));

        let blacklist = SocketValidation {
            namespace_blacklist: vec!["sandbox".to_string()],
            ..Default::default()
        };
        assert!(!blacklist.allows("sandbox"));
        assert!(blacklist.allows("apps"));
    }

    #[test]
    fn test_coupled_plugs_message() {
        assert_eq!(coupled_plugs_message(0), "0 plugs coupled");
        assert_eq!(coupled_plugs_message(1), "1 plug coupled");
        assert_eq!(coupled_plugs_message(3), "3 plugs coupled");
    }
}
