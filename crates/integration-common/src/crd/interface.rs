//! Interface CRD types
//!
//! An `Interface` is the contract between a plug and a socket: the config each
//! side must provide and the result each side produces.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::SchemaProperties;

/// Properties per side
///
/// A side left out has no schema, so its map passes through unvalidated.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SideProperties {
    /// Properties of the plug side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plug: Option<SchemaProperties>,
    /// Properties of the socket side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<SchemaProperties>,
}

/// Schema exchanged between a plug and a socket
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "integration.rock8s.com",
    version = "v1beta1",
    kind = "Interface",
    plural = "interfaces",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSpec {
    /// Config properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SideProperties>,
    /// Result properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SideProperties>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_sided_interface_leaves_other_side_unschematized() {
        let spec: InterfaceSpec = serde_yaml::from_str(
            r#"
result:
  socket:
    host:
      required: true
"#,
        )
        .unwrap();

        let result = spec.result.unwrap();
        assert!(result.plug.is_none());
        assert!(result.socket.unwrap()["host"].required);
        assert!(spec.config.is_none());
    }

    #[test]
    fn test_empty_side_is_distinct_from_missing_side() {
        let spec: InterfaceSpec =
            serde_json::from_str(r#"{"config":{"plug":{}}}"#).unwrap();
        let config = spec.config.unwrap();
        assert_eq!(config.plug, Some(SchemaProperties::new()));
        assert!(config.socket.is_none());

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out, serde_json::json!({"plug": {}}));
    }
}
