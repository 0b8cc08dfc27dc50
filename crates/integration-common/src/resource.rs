//! Templated resource applier
//!
//! Renders the manifests declared on a plug, socket or deferred resource and
//! applies, deletes or recreates them through a [`DynamicClient`], so any
//! kind the cluster serves can be managed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::crd::{Do, Resource, ResourceAction, When};
use crate::kube_utils::{
    impersonating, parse_manifest, service_account_user, DynamicClient, KubeDynamicClient,
    ManifestMetadata,
};
use crate::retry::{retry_while, RetryConfig};
use crate::template::TemplateEngine;
use crate::Error;

/// Attempts made to read back an applied object
pub const POST_APPLY_ATTEMPTS: u32 = 5;

/// Interval between reads of an applied object
pub const POST_APPLY_INTERVAL: Duration = Duration::from_secs(2);

/// Resources that run on the given hook, in declaration order
pub fn get_resources(resources: &[Resource], when: When) -> Vec<&Resource> {
    resources.iter().filter(|r| r.runs_on(when)).collect()
}

/// Renders and executes resource actions against the cluster
pub struct ResourceApplier {
    dynamic: Arc<dyn DynamicClient>,
    templates: TemplateEngine,
    post_apply_retry: RetryConfig,
}

impl ResourceApplier {
    /// Create an applier over the given dynamic client
    pub fn new(dynamic: Arc<dyn DynamicClient>) -> Self {
        Self {
            dynamic,
            templates: TemplateEngine::new(),
            post_apply_retry: RetryConfig::fixed(POST_APPLY_ATTEMPTS, POST_APPLY_INTERVAL),
        }
    }

    /// Override how applied objects are read back
    pub fn with_post_apply_retry(mut self, retry: RetryConfig) -> Self {
        self.post_apply_retry = retry;
        self
    }

    /// The dynamic client used for cluster access
    pub fn dynamic(&self) -> &Arc<dyn DynamicClient> {
        &self.dynamic
    }

    /// Run every resource registered for `when`
    ///
    /// Returns the objects that were applied or created. Delete actions of
    /// resources marked `retainWhenDecoupled` are skipped on the decoupled hook.
    pub async fn process_resources(
        &self,
        resources: &[Resource],
        when: When,
        ctx: &Value,
        default_namespace: &str,
    ) -> Result<Vec<Value>, Error> {
        let mut touched = Vec::new();
        for resource in get_resources(resources, when) {
            if when == When::Decoupled
                && resource.retain_when_decoupled
                && resource.action.do_ == Do::Delete
            {
                debug!(hook = %when, "retaining resource on decouple");
                continue;
            }
            touched.extend(
                self.process_action(&resource.action, ctx, default_namespace)
                    .await?,
            );
        }
        Ok(touched)
    }

    /// Render one action and execute it for each manifest it yields
    pub async fn process_action(
        &self,
        action: &ResourceAction,
        ctx: &Value,
        default_namespace: &str,
    ) -> Result<Vec<Value>, Error> {
        let mut touched = Vec::new();
        for manifest in self.render_action(action, ctx)? {
            match action.do_ {
                Do::Apply => touched.push(self.apply_manifest(manifest, default_namespace).await?),
                Do::Delete => {
                    self.delete_manifest(manifest, default_namespace).await?;
                }
                Do::Recreate => {
                    touched.push(self.recreate_manifest(manifest, default_namespace).await?)
                }
            }
        }
        Ok(touched)
    }

    /// Render every template of an action into manifests
    ///
    /// String templates that render to nothing (a false `{% if %}`) are skipped.
    pub fn render_action(&self, action: &ResourceAction, ctx: &Value) -> Result<Vec<Value>, Error> {
        let mut manifests = Vec::new();

        for template in action.template.iter().chain(action.templates.iter()) {
            let rendered = self.templates.render_value(template, ctx)?;
            if !rendered.is_null() {
                manifests.push(rendered);
            }
        }

        for template in action
            .string_template
            .iter()
            .chain(action.string_templates.iter())
        {
            let rendered = self.templates.render(template, ctx)?;
            if rendered.trim().is_empty() {
                continue;
            }
            let manifest = parse_manifest(&rendered)?;
            if !manifest.is_null() {
                manifests.push(manifest);
            }
        }

        Ok(manifests)
    }

    /// Server-side apply a manifest and read it back
    ///
    /// The read is retried at a fixed interval while the object is not yet visible.
    pub async fn apply_manifest(&self, manifest: Value, default_namespace: &str) -> Result<Value, Error> {
        let meta = ManifestMetadata::from_value(&manifest)?;
        let applied = self
            .dynamic
            .apply(manifest, default_namespace.to_string())
            .await?;
        let namespace = ManifestMetadata::from_value(&applied)
            .ok()
            .and_then(|m| m.namespace)
            .or(meta.namespace.clone());
        info!(resource = %meta, "applied resource");

        retry_while(
            &self.post_apply_retry,
            "get_applied_resource",
            Error::is_not_found,
            || {
                let namespace = namespace.clone();
                let meta = &meta;
                async move {
                    self.dynamic
                        .get(&meta.api_version, &meta.kind, &meta.name, namespace)
                        .await?
                        .ok_or_else(|| Error::not_found(meta.kind.clone(), meta.to_string()))
                }
            },
        )
        .await
    }

    /// Delete the object a manifest describes, tolerating not found
    pub async fn delete_manifest(&self, manifest: Value, default_namespace: &str) -> Result<bool, Error> {
        let meta = ManifestMetadata::from_value(&manifest)?;
        match self.dynamic.delete(manifest, default_namespace.to_string()).await {
            Ok(deleted) => {
                if deleted {
                    info!(resource = %meta, "deleted resource");
                } else {
                    debug!(resource = %meta, "resource already gone");
                }
                Ok(deleted)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete then create the object a manifest describes
    pub async fn recreate_manifest(&self, manifest: Value, default_namespace: &str) -> Result<Value, Error> {
        self.delete_manifest(manifest.clone(), default_namespace).await?;
        let created = self
            .dynamic
            .create(manifest, default_namespace.to_string())
            .await?;
        if let Ok(meta) = ManifestMetadata::from_value(&created) {
            info!(resource = %meta, "recreated resource");
        }
        Ok(created)
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Picks the applier acting for an object's ServiceAccount
pub trait ApplierSource: Send + Sync {
    /// Applier for an object in `namespace`
    ///
    /// With a `service_account` the applier acts as that ServiceAccount of
    /// `namespace`; without one it acts as the operator.
    fn applier_for(
        &self,
        namespace: &str,
        service_account: Option<&str>,
    ) -> Result<Arc<ResourceApplier>, Error>;
}

/// One applier for every identity
pub struct SharedApplier(Arc<ResourceApplier>);

impl SharedApplier {
    /// Wrap one applier to serve every identity
    pub fn new(applier: ResourceApplier) -> Self {
        Self(Arc::new(applier))
    }
}

impl ApplierSource for SharedApplier {
    fn applier_for(&self, _: &str, _: Option<&str>) -> Result<Arc<ResourceApplier>, Error> {
        Ok(self.0.clone())
    }
}

/// Appliers that impersonate the requested ServiceAccount
///
/// Clients are built on first use per account and kept for later passes.
pub struct ImpersonatingAppliers {
    config: kube::Config,
    operator: Arc<ResourceApplier>,
    by_user: Mutex<HashMap<String, Arc<ResourceApplier>>>,
}

impl ImpersonatingAppliers {
    /// Appliers derived from the operator's own cluster config
    pub fn new(config: kube::Config) -> Result<Self, Error> {
        let operator = applier_from(config.clone())?;
        Ok(Self {
            config,
            operator,
            by_user: Mutex::new(HashMap::new()),
        })
    }

    /// Number of impersonated accounts with a client
    pub fn accounts(&self) -> usize {
        self.by_user.lock().len()
    }
}

fn applier_from(config: kube::Config) -> Result<Arc<ResourceApplier>, Error> {
    let client = kube::Client::try_from(config)?;
    Ok(Arc::new(ResourceApplier::new(Arc::new(KubeDynamicClient::new(client)))))
}

impl ApplierSource for ImpersonatingAppliers {
    fn applier_for(
        &self,
        namespace: &str,
        service_account: Option<&str>,
    ) -> Result<Arc<ResourceApplier>, Error> {
        let Some(account) = service_account.filter(|sa| !sa.is_empty()) else {
            return Ok(self.operator.clone());
        };
        let user = service_account_user(namespace, account);
        let mut by_user = self.by_user.lock();
        if let Some(applier) = by_user.get(&user) {
            return Ok(applier.clone());
        }
        debug!(user = %user, "building impersonating client");
        let applier = applier_from(impersonating(&self.config, &user))?;
        by_user.insert(user, applier.clone());
        Ok(applier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_utils::MockDynamicClient;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx() -> Value {
        json!({
            "plug": { "metadata": { "name": "app", "namespace": "apps" } },
            "socket": { "metadata": { "name": "db", "namespace": "data" } },
            "plugConfig": {},
            "socketConfig": { "host": "10.0.0.5" },
            "plugResult": {},
            "socketResult": {}
        })
    }

    fn config_map_resource(when: Vec<When>, do_: Do) -> Resource {
        Resource {
            action: ResourceAction {
                do_,
                template: Some(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "{{ plug.metadata.name }}-db" },
                    "data": { "HOST": "{{ socketConfig.host }}" }
                })),
                ..Default::default()
            },
            retain_when_decoupled: false,
            when,
        }
    }

    fn echo_apply(mock: &mut MockDynamicClient) {
        mock.expect_apply().returning(|mut manifest, ns| {
            manifest["metadata"]["namespace"] = json!(ns);
            Ok(manifest)
        });
    }

    #[test]
    fn test_get_resources_filters_by_hook() {
        let resources = vec![
            config_map_resource(vec![When::Coupled], Do::Apply),
            config_map_resource(vec![When::Decoupled], Do::Delete),
            config_map_resource(vec![When::Coupled, When::Changed], Do::Apply),
        ];

        assert_eq!(get_resources(&resources, When::Coupled).len(), 2);
        assert_eq!(get_resources(&resources, When::Changed).len(), 1);
        assert_eq!(get_resources(&resources, When::Decoupled).len(), 1);
        assert!(get_resources(&resources, When::Created).is_empty());
    }

    #[test]
    fn test_render_string_templates() {
        let applier = ResourceApplier::new(Arc::new(MockDynamicClient::new()));
        let action = ResourceAction {
            string_templates: vec![
                "apiVersion: v1\nkind: Secret\nmetadata:\n  name: {{ plug.metadata.name }}-creds\n"
                    .to_string(),
                "{% if false %}apiVersion: v1{% endif %}".to_string(),
            ],
            ..Default::default()
        };

        let manifests = applier.render_action(&action, &ctx()).unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0]["metadata"]["name"], "app-creds");
    }

    #[test]
    fn test_render_error_surfaces() {
        let applier = ResourceApplier::new(Arc::new(MockDynamicClient::new()));
        let action = ResourceAction {
            string_template: Some("name: {{ socketConfig.port }}".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            applier.render_action(&action, &ctx()),
            Err(Error::Template { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_runs_only_matching_hook() {
        let mut mock = MockDynamicClient::new();
        echo_apply(&mut mock);
        mock.expect_get()
            .withf(|api, kind, name, ns| {
                api == "v1" && kind == "ConfigMap" && name == "app-db" && ns.as_deref() == Some("apps")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(Some(json!({ "kind": "ConfigMap" }))));

        let applier = ResourceApplier::new(Arc::new(mock));
        let resources = vec![
            config_map_resource(vec![When::Coupled], Do::Apply),
            config_map_resource(vec![When::Deleted], Do::Apply),
        ];

        let touched = applier
            .process_resources(&resources, When::Coupled, &ctx(), "apps")
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_apply_get_retries_until_visible() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let mut mock = MockDynamicClient::new();
        echo_apply(&mut mock);
        mock.expect_get().returning(move |_, _, _, _| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(None)
            } else {
                Ok(Some(json!({ "kind": "ConfigMap" })))
            }
        });

        let applier = ResourceApplier::new(Arc::new(mock));
        let resources = vec![config_map_resource(vec![When::Coupled], Do::Apply)];
        let result = applier
            .process_resources(&resources, When::Coupled, &ctx(), "apps")
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_apply_get_gives_up_with_not_found() {
        let mut mock = MockDynamicClient::new();
        echo_apply(&mut mock);
        mock.expect_get().times(5).returning(|_, _, _, _| Ok(None));

        let applier = ResourceApplier::new(Arc::new(mock));
        let resources = vec![config_map_resource(vec![When::Coupled], Do::Apply)];
        let err = applier
            .process_resources(&resources, When::Coupled, &ctx(), "apps")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let mut mock = MockDynamicClient::new();
        mock.expect_delete().times(1).returning(|_, _| Ok(false));

        let applier = ResourceApplier::new(Arc::new(mock));
        let resources = vec![config_map_resource(vec![When::Decoupled], Do::Delete)];
        let touched = applier
            .process_resources(&resources, When::Decoupled, &ctx(), "apps")
            .await
            .unwrap();
        assert!(touched.is_empty());
    }

    #[tokio::test]
    async fn test_retained_resources_survive_decouple() {
        let mut mock = MockDynamicClient::new();
        mock.expect_delete().times(0);

        let applier = ResourceApplier::new(Arc::new(mock));
        let mut retained = config_map_resource(vec![When::Decoupled], Do::Delete);
        retained.retain_when_decoupled = true;

        applier
            .process_resources(&[retained], When::Decoupled, &ctx(), "apps")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recreate_deletes_then_creates() {
        let mut seq = mockall::Sequence::new();
        let mut mock = MockDynamicClient::new();
        mock.expect_delete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        mock.expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|manifest, _| Ok(manifest));

        let applier = ResourceApplier::new(Arc::new(mock));
        let resources = vec![config_map_resource(vec![When::Changed], Do::Recreate)];
        let touched = applier
            .process_resources(&resources, When::Changed, &ctx(), "apps")
            .await
            .unwrap();
        assert_eq!(touched[0]["data"]["HOST"], "10.0.0.5");
    }

    // =========================================================================
    // Identity
    // =========================================================================

    #[tokio::test]
    async fn test_impersonated_appliers_are_per_account() {
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        let appliers = ImpersonatingAppliers::new(config).unwrap();

        let operator = appliers.applier_for("apps", None).unwrap();
        let blank = appliers.applier_for("apps", Some("")).unwrap();
        assert!(Arc::ptr_eq(&operator, &blank));
        assert_eq!(appliers.accounts(), 0);

        let deployer = appliers.applier_for("apps", Some("deployer")).unwrap();
        let again = appliers.applier_for("apps", Some("deployer")).unwrap();
        let elsewhere = appliers.applier_for("data", Some("deployer")).unwrap();
        assert!(Arc::ptr_eq(&deployer, &again));
        assert!(!Arc::ptr_eq(&deployer, &operator));
        assert!(!Arc::ptr_eq(&deployer, &elsewhere));
        assert_eq!(appliers.accounts(), 2);
    }

    #[test]
    fn test_shared_applier_ignores_identity() {
        let shared = SharedApplier::new(ResourceApplier::new(Arc::new(MockDynamicClient::new())));
        let a = shared.applier_for("apps", Some("deployer")).unwrap();
        let b = shared.applier_for("data", None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
