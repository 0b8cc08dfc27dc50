//! Kubernetes helpers shared by the controllers
//!
//! The `DynamicClient` trait is the kind-agnostic seam used to read `Var`
//! targets and to apply, create and delete templated manifests. The real
//! implementation resolves every manifest's group/version/kind through API
//! discovery so that namespaced and cluster-scoped kinds are both handled.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for kube clients; watches time out before this
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Manifest parsing
// =============================================================================

/// Identity of a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMetadata {
    /// apiVersion of the manifest
    pub api_version: String,
    /// Kind of the manifest
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Namespace from the manifest, if set
    pub namespace: Option<String>,
}

impl ManifestMetadata {
    /// Read the identity of a manifest value
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Error> {
        let field = |pointer: &str, what: &str| {
            value
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::internal_with_context("parse_manifest", format!("manifest missing {}", what))
                })
        };

        Ok(Self {
            api_version: field("/apiVersion", "apiVersion")?,
            kind: field("/kind", "kind")?,
            name: field("/metadata/name", "metadata.name")?,
            namespace: value
                .pointer("/metadata/namespace")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    /// Group/version/kind of the manifest
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.api_version);
        GroupVersionKind {
            group,
            version,
            kind: self.kind.clone(),
        }
    }
}

impl std::fmt::Display for ManifestMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Parse a manifest string - JSON first, then YAML
pub fn parse_manifest(manifest: &str) -> Result<serde_json::Value, Error> {
    if manifest.trim_start().starts_with('{') {
        serde_json::from_str(manifest).map_err(|e| {
            Error::internal_with_context(
                "parse_manifest",
                format!("failed to parse manifest as JSON: {}", e),
            )
        })
    } else {
        serde_yaml::from_str(manifest).map_err(|e| {
            Error::internal_with_context(
                "parse_manifest",
                format!("failed to parse manifest as YAML: {}", e),
            )
        })
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use integration_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind without discovery
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Pluralize a Kubernetes resource kind using the usual English rules
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('x') {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Extract a dotted path (`status.loadBalancer.ingress.0.ip`) from a JSON value
///
/// Numeric segments index into arrays. A leading `.` or a JSON pointer
/// (`/status/phase`) is accepted too.
pub fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.starts_with('/') {
        return value.pointer(path);
    }
    let mut current = value;
    for segment in path.trim_start_matches('.').split('.').filter(|s| !s.is_empty()) {
        current = match current {
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            other => other.get(segment)?,
        };
    }
    Some(current)
}

/// Render a JSON value as a plain string (strings are not quoted)
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// =============================================================================
// Client construction
// =============================================================================

/// Infer the cluster config with explicit connect and read timeouts
pub async fn infer_config_with_timeout(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<kube::Config, Error> {
    let mut config = kube::Config::infer()
        .await
        .map_err(|e| Error::internal_with_context("create_client", e.to_string()))?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Ok(config)
}

/// Username the API server gives a ServiceAccount
pub fn service_account_user(namespace: &str, name: &str) -> String {
    format!("system:serviceaccount:{}:{}", namespace, name)
}

/// Copy of `config` whose requests act as `user`
pub fn impersonating(config: &kube::Config, user: &str) -> kube::Config {
    let mut config = config.clone();
    config.auth_info.impersonate = Some(user.to_string());
    config.auth_info.impersonate_groups = None;
    config
}

// =============================================================================
// Typed helpers
// =============================================================================

/// Patch the status sub-resource of a namespaced resource with optimistic locking
///
/// When `resource_version` is given it is sent with the patch, so a stale
/// write is rejected with a 409 and surfaces as [`Error::Conflict`].
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    resource_version: Option<&str>,
    status: &impl Serialize,
) -> Result<T, Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = match resource_version {
        Some(rv) => serde_json::json!({ "metadata": { "resourceVersion": rv }, "status": status }),
        None => serde_json::json!({ "status": status }),
    };
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::from_kube(format!("{}/{}", namespace, name), T::kind(&Default::default()).as_ref(), e))
}

/// Get a namespaced resource, mapping 404 to `None`
pub async fn get_optional<T>(client: &Client, name: &str, namespace: &str) -> Result<Option<T>, Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    api.get_opt(name).await.map_err(Error::from)
}

/// Add a finalizer to a namespaced resource if absent
pub async fn add_finalizer<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
) -> Result<(), Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let current = api.get(name).await?;
    let mut finalizers = current.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Remove a finalizer from a namespaced resource; not found is not an error
pub async fn remove_finalizer<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
) -> Result<(), Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let Some(current) = api.get_opt(name).await? else {
        return Ok(());
    };
    let finalizers: Vec<String> = current
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != finalizer)
        .collect();

    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    match api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a resource carries the given finalizer
pub fn has_finalizer<T: Resource>(resource: &T, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

// =============================================================================
// Dynamic client
// =============================================================================

/// Kind-agnostic access to arbitrary cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// Get an object as JSON; `None` when it does not exist
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<String>,
    ) -> Result<Option<serde_json::Value>, Error>;

    /// Server-side apply a manifest, returning the applied object
    ///
    /// Namespaced kinds without a namespace land in `default_namespace`.
    async fn apply(
        &self,
        manifest: serde_json::Value,
        default_namespace: String,
    ) -> Result<serde_json::Value, Error>;

    /// Create a manifest, returning the created object
    async fn create(
        &self,
        manifest: serde_json::Value,
        default_namespace: String,
    ) -> Result<serde_json::Value, Error>;

    /// Delete the object a manifest describes; returns false if it did not exist
    async fn delete(&self, manifest: serde_json::Value, default_namespace: String)
        -> Result<bool, Error>;
}

/// Real dynamic client resolving kinds through cached API discovery
pub struct KubeDynamicClient {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeDynamicClient {
    /// Create a dynamic client; discovery runs lazily on first use
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(None),
        }
    }

    async fn run_discovery(&self) -> Result<Arc<Discovery>, Error> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| {
                Error::internal_with_context("discovery", format!("API discovery failed: {}", e))
            })?;
        let discovery = Arc::new(discovery);
        *self.discovery.write().await = Some(discovery.clone());
        Ok(discovery)
    }

    /// Resolve a GVK, refreshing discovery once when the kind is unknown
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities), Error> {
        let cached = self.discovery.read().await.clone();
        if let Some(discovery) = cached {
            if let Some(found) = discovery.resolve_gvk(gvk) {
                return Ok(found);
            }
        }
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "refreshing API discovery");
        self.run_discovery()
            .await?
            .resolve_gvk(gvk)
            .ok_or_else(|| {
                Error::internal_with_context(
                    "discovery",
                    format!("unknown resource type: {}/{} {}", gvk.group, gvk.version, gvk.kind),
                )
            })
    }

    async fn api_for(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, ApiResource, Option<String>), Error> {
        let (ar, caps) = self.resolve(gvk).await?;
        match caps.scope {
            Scope::Namespaced => {
                let ns = namespace.unwrap_or("default").to_string();
                Ok((Api::namespaced_with(self.client.clone(), &ns, &ar), ar, Some(ns)))
            }
            Scope::Cluster => Ok((Api::all_with(self.client.clone(), &ar), ar, None)),
        }
    }

    async fn manifest_api(
        &self,
        manifest: &mut serde_json::Value,
        default_namespace: &str,
    ) -> Result<(Api<DynamicObject>, ManifestMetadata), Error> {
        let meta = ManifestMetadata::from_value(manifest)?;
        let wanted = meta.namespace.as_deref().unwrap_or(default_namespace);
        let (api, _, namespace) = self.api_for(&meta.gvk(), Some(wanted)).await?;
        if let (Some(ns), Some(metadata)) = (&namespace, manifest.get_mut("metadata")) {
            metadata["namespace"] = serde_json::Value::String(ns.clone());
        }
        Ok((api, ManifestMetadata { namespace, ..meta }))
    }
}

fn object_to_value(object: DynamicObject) -> Result<serde_json::Value, Error> {
    serde_json::to_value(object).map_err(Error::from)
}

#[async_trait]
impl DynamicClient for KubeDynamicClient {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<String>,
    ) -> Result<Option<serde_json::Value>, Error> {
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        };
        let (api, _, _) = self.api_for(&gvk, namespace.as_deref()).await?;
        match api.get_opt(name).await? {
            Some(object) => Ok(Some(object_to_value(object)?)),
            None => Ok(None),
        }
    }

    async fn apply(
        &self,
        mut manifest: serde_json::Value,
        default_namespace: String,
    ) -> Result<serde_json::Value, Error> {
        let (api, meta) = self.manifest_api(&mut manifest, &default_namespace).await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(&meta.name, &params, &Patch::Apply(&manifest))
            .await
            .map_err(|e| Error::from_kube(meta.to_string(), &meta.kind, e))?;
        trace!(resource = %meta, "applied manifest");
        object_to_value(applied)
    }

    async fn create(
        &self,
        mut manifest: serde_json::Value,
        default_namespace: String,
    ) -> Result<serde_json::Value, Error> {
        let (api, meta) = self.manifest_api(&mut manifest, &default_namespace).await?;
        let object: DynamicObject = serde_json::from_value(manifest)?;
        let created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| Error::from_kube(meta.to_string(), &meta.kind, e))?;
        trace!(resource = %meta, "created manifest");
        object_to_value(created)
    }

    async fn delete(
        &self,
        mut manifest: serde_json::Value,
        default_namespace: String,
    ) -> Result<bool, Error> {
        let (api, meta) = self.manifest_api(&mut manifest, &default_namespace).await?;
        match api.delete(&meta.name, &DeleteParams::background()).await {
            Ok(_) => {
                trace!(resource = %meta, "deleted manifest");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(Error::from_kube(meta.to_string(), &meta.kind, e)),
        }
    }
}
