//! Types shared by the Plug, Socket and DeferredResource specs

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Schema for free-form JSON fields (templates, raw manifests)
pub(crate) fn preserve_unknown_fields(
    _gen: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    let mut extensions = schemars::Map::new();
    extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        extensions,
        ..Default::default()
    })
}

/// Schema for lists of free-form JSON objects
pub(crate) fn preserve_unknown_fields_list(
    gen: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    schemars::schema::Schema::Object(schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Array.into()),
        array: Some(Box::new(schemars::schema::ArrayValidation {
            items: Some(preserve_unknown_fields(gen).into()),
            ..Default::default()
        })),
        ..Default::default()
    })
}

// =============================================================================
// References
// =============================================================================

/// Reference to a namespaced object; namespace defaults per call site
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedName {
    /// Object name
    pub name: String,
    /// Object namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl NamespacedName {
    /// Create a reference
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace,
        }
    }

    /// Namespace, falling back to `default_namespace` when unset or empty
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => default_namespace,
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Identity of a coupled object recorded in status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CoupledRef {
    /// API version of the object
    pub api_version: String,
    /// Kind of the object
    pub kind: String,
    /// Name of the object
    pub name: String,
    /// Namespace of the object
    pub namespace: String,
    /// UID of the object
    pub uid: String,
}

/// Reference to an arbitrary object, by apiVersion or group + version
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Full API version (e.g. `apps/v1`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// API group, used with `version` when `apiVersion` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// API version within the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Kind of the object
    pub kind: String,
    /// Name of the object
    pub name: String,
    /// Namespace of the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Target {
    /// Effective apiVersion, built from group and version when not given
    pub fn resolved_api_version(&self) -> String {
        if let Some(api_version) = self.api_version.as_deref().filter(|v| !v.is_empty()) {
            return api_version.to_string();
        }
        let version = self.version.as_deref().unwrap_or("v1");
        match self.group.as_deref().filter(|g| !g.is_empty()) {
            Some(group) => format!("{}/{}", group, version),
            None => version.to_string(),
        }
    }
}

// =============================================================================
// Vars
// =============================================================================

/// Field selector on a referenced object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    /// Dotted path into the object (e.g. `status.loadBalancer.ingress.0.ip`)
    pub field_path: String,
}

/// Named value pulled from another object at reconcile time
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Var {
    /// Name the value is exposed under
    pub name: String,
    /// Object to read
    pub objref: Target,
    /// Field to extract; `metadata.name` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fieldref: Option<FieldRef>,
}

// =============================================================================
// Resources
// =============================================================================

/// Lifecycle hook a resource action runs on
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum When {
    /// First time the object is observed
    Created,
    /// Plug and socket were coupled
    Coupled,
    /// An existing coupling changed
    #[serde(alias = "updated")]
    Changed,
    /// Plug and socket were decoupled
    Decoupled,
    /// Object is being deleted
    Deleted,
    /// A coupling pass failed after the pair was coupled
    Broken,
}

impl std::fmt::Display for When {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Coupled => write!(f, "coupled"),
            Self::Changed => write!(f, "changed"),
            Self::Decoupled => write!(f, "decoupled"),
            Self::Deleted => write!(f, "deleted"),
            Self::Broken => write!(f, "broken"),
        }
    }
}

/// What to do with a rendered manifest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Do {
    /// Server-side apply
    #[default]
    Apply,
    /// Delete, tolerating not found
    Delete,
    /// Delete then create
    Recreate,
}

impl std::fmt::Display for Do {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Delete => write!(f, "delete"),
            Self::Recreate => write!(f, "recreate"),
        }
    }
}

/// A templated manifest and the action to perform with it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAction {
    /// Action to perform
    #[serde(default, rename = "do")]
    pub do_: Do,
    /// Structured manifest whose string leaves are templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: Option<serde_json::Value>,
    /// Structured manifests whose string leaves are templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub templates: Vec<serde_json::Value>,
    /// Manifest as a template string (YAML or JSON once rendered)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_template: Option<String>,
    /// Manifests as template strings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub string_templates: Vec<String>,
}

/// A resource action gated by lifecycle hooks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// The action and its templates
    #[serde(flatten)]
    pub action: ResourceAction,
    /// Skip delete actions for this resource on the decoupled hook
    #[serde(default)]
    pub retain_when_decoupled: bool,
    /// Hooks this resource runs on
    #[serde(default)]
    pub when: Vec<When>,
}

impl Resource {
    /// Whether this resource runs on the given hook
    pub fn runs_on(&self, when: When) -> bool {
        self.when.contains(&when)
    }
}

// =============================================================================
// Apparatus and interface schema
// =============================================================================

/// External HTTP endpoint consulted for config and notified of events
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecApparatus {
    /// Base URL; `http://` is assumed when no scheme is given
    pub endpoint: String,
    /// Idle timeout in seconds, passed through to the apparatus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u32>,
}

/// A property declared by an interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaProperty {
    /// Value used when none was resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether resolution fails when the property is missing
    #[serde(default)]
    pub required: bool,
}

/// Properties keyed by name
pub type SchemaProperties = BTreeMap<String, SchemaProperty>;
