//! Data, config and result sources declared identically by plugs and sockets

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{Resource, ResourceAction, SpecApparatus, Var};

/// Where one map (data, config or result) is read from
///
/// Borrowed view used by the resolver so that the three maps share one code path.
#[derive(Clone, Copy, Debug)]
pub struct MapSources<'a> {
    /// Literal entries
    pub literal: &'a BTreeMap<String, String>,
    /// Secret whose keys are copied in first
    pub secret_name: Option<&'a str>,
    /// ConfigMap whose keys are copied in last
    pub config_map_name: Option<&'a str>,
    /// Entries rendered against the lookup context
    pub template: Option<&'a BTreeMap<String, String>>,
}

/// Sources shared by the Plug and Socket specs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CouplingSources {
    /// Vars exposed to config templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<Var>,
    /// Vars exposed to result templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_vars: Vec<Var>,

    /// Literal data exposed to templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    /// ConfigMap merged into data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_config_map_name: Option<String>,
    /// Secret merged into data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,

    /// Literal config
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// ConfigMap merged into config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_config_map_name: Option<String>,
    /// Secret merged into config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret_name: Option<String>,
    /// Templated config entries
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_template: BTreeMap<String, String>,

    /// Literal result
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result: BTreeMap<String, String>,
    /// ConfigMap merged into result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_config_map_name: Option<String>,
    /// Secret merged into result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_secret_name: Option<String>,
    /// Templated result entries
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result_template: BTreeMap<String, String>,

    /// ServiceAccount used for applied resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Apparatus consulted for config and notified of lifecycle events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparatus: Option<SpecApparatus>,
    /// Resources applied on lifecycle hooks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    /// Resources applied once results are resolved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_resources: Vec<ResourceAction>,
    /// Change to force the coupling to be reprocessed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
}

impl CouplingSources {
    /// Sources of the data map (no templates)
    pub fn data_sources(&self) -> MapSources<'_> {
        MapSources {
            literal: &self.data,
            secret_name: self.data_secret_name.as_deref(),
            config_map_name: self.data_config_map_name.as_deref(),
            template: None,
        }
    }

    /// Sources of the config map
    pub fn config_sources(&self) -> MapSources<'_> {
        MapSources {
            literal: &self.config,
            secret_name: self.config_secret_name.as_deref(),
            config_map_name: self.config_config_map_name.as_deref(),
            template: Some(&self.config_template),
        }
    }

    /// Sources of the result map
    pub fn result_sources(&self) -> MapSources<'_> {
        MapSources {
            literal: &self.result,
            secret_name: self.result_secret_name.as_deref(),
            config_map_name: self.result_config_map_name.as_deref(),
            template: Some(&self.result_template),
        }
    }

    /// Whether any result source is declared
    pub fn declares_result(&self) -> bool {
        !self.result.is_empty()
            || !self.result_template.is_empty()
            || self.result_secret_name.is_some()
            || self.result_config_map_name.is_some()
    }
}
