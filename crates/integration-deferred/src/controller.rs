//! DeferredResource reconciliation
//!
//! A pass waits out the timeout, then waits for every `waitFor` object, then
//! applies the manifest and records the applied object's identity. Deleting
//! the DeferredResource deletes what it applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use integration_common::crd::{
    find_condition, reason, remove_condition, set_condition, Condition, ConditionStatus,
    DeferredResource, DeferredResourceStatus, CONDITION_FAILED, CONDITION_RESOLVED,
};
use integration_common::kube_utils::{
    add_finalizer, has_finalizer, patch_resource_status, remove_finalizer,
};
use integration_common::resource::{ApplierSource, ImpersonatingAppliers, ResourceApplier};
use integration_common::{Error, FINALIZER};

use crate::error::DeferredError;

/// Requeue interval while a `waitFor` object is missing
pub const WAIT_FOR_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue interval after a retryable failure
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue interval after an optimistic concurrency conflict
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Trait abstracting Kubernetes operations on DeferredResources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeferredClient: Send + Sync {
    /// Patch the status, rejecting stale writes
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &DeferredResourceStatus,
    ) -> Result<(), Error>;

    /// Add the operator finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the operator finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeDeferredClient {
    client: Client,
}

impl KubeDeferredClient {
    /// Create a new KubeDeferredClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeferredClient for KubeDeferredClient {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &DeferredResourceStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<DeferredResource>(
            &self.client,
            name,
            namespace,
            resource_version.as_deref(),
            status,
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        add_finalizer::<DeferredResource>(&self.client, name, namespace, FINALIZER).await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        remove_finalizer::<DeferredResource>(&self.client, name, namespace, FINALIZER).await
    }
}

/// Controller context
pub struct Context {
    /// DeferredResource access
    pub client: Arc<dyn DeferredClient>,
    /// Appliers for the deferred manifest, per `serviceAccountName`
    pub appliers: Arc<dyn ApplierSource>,
}

impl Context {
    /// Create a context over a kube client
    ///
    /// `config` is the client's own config; manifests of resources naming a
    /// ServiceAccount are applied through clients impersonating it.
    pub fn new(client: Client, config: kube::Config) -> Result<Self, Error> {
        Ok(Self {
            client: Arc::new(KubeDeferredClient::new(client)),
            appliers: Arc::new(ImpersonatingAppliers::new(config)?),
        })
    }

    /// Create a context with custom implementations
    pub fn with_parts(client: Arc<dyn DeferredClient>, appliers: Arc<dyn ApplierSource>) -> Self {
        Self { client, appliers }
    }

    fn applier(
        &self,
        resource: &DeferredResource,
        namespace: &str,
    ) -> Result<Arc<ResourceApplier>, Error> {
        self.appliers
            .applier_for(namespace, resource.spec.service_account_name.as_deref())
    }
}

/// Time left before a resource created at `created` may be applied
///
/// `None` once the timeout has elapsed or when no timeout is set.
pub fn remaining_timeout(
    created: Option<DateTime<Utc>>,
    timeout_secs: i64,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if timeout_secs <= 0 {
        return None;
    }
    let deadline = created.unwrap_or(now) + TimeDelta::try_seconds(timeout_secs)?;
    (deadline - now).to_std().ok().filter(|left| !left.is_zero())
}

/// Owner reference pointing at an applied object
pub fn owner_reference(applied: &Value) -> Option<OwnerReference> {
    let metadata = applied.get("metadata")?;
    Some(OwnerReference {
        api_version: applied.get("apiVersion")?.as_str()?.to_string(),
        kind: applied.get("kind")?.as_str()?.to_string(),
        name: metadata.get("name")?.as_str()?.to_string(),
        uid: metadata
            .get("uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ..Default::default()
    })
}

fn is_resolved(resource: &DeferredResource) -> bool {
    let generation = resource.metadata.generation.unwrap_or_default();
    resource
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_RESOLVED))
        .is_some_and(|c| c.is_true() && c.observed_generation == generation)
}

/// Reconcile a DeferredResource
#[instrument(skip(resource, ctx), fields(deferred_resource = %resource.name_any()))]
pub async fn reconcile(
    resource: Arc<DeferredResource>,
    ctx: Arc<Context>,
) -> Result<Action, DeferredError> {
    let name = resource.name_any();
    let namespace = resource
        .namespace()
        .ok_or_else(|| DeferredError::MissingNamespace(name.clone()))?;

    if resource.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&*resource, FINALIZER) {
            let deleted = ctx
                .applier(&resource, &namespace)?
                .delete_manifest(resource.spec.resource.clone(), &namespace)
                .await?;
            debug!(deleted, "cleaned up deferred resource target");
            ctx.client.remove_finalizer(&name, &namespace).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&*resource, FINALIZER) {
        ctx.client.add_finalizer(&name, &namespace).await?;
        return Ok(Action::await_change());
    }

    if is_resolved(&resource) {
        debug!("already resolved at this generation");
        return Ok(Action::await_change());
    }

    match resolve(&resource, &namespace, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) if e.is_conflict() => Err(e),
        Err(e) if e.is_missing_required() => {
            warn!(error = %e, "required property missing, retrying");
            Ok(Action::requeue(ERROR_REQUEUE))
        }
        Err(e) => {
            warn!(error = %e, "deferred resource failed");
            let generation = resource.metadata.generation.unwrap_or_default();
            let mut status = resource.status.clone().unwrap_or_default();
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_FAILED,
                    ConditionStatus::True,
                    reason::ERROR,
                    e.to_string(),
                    generation,
                ),
            );
            update_status(&resource, &namespace, &ctx, status).await?;
            if e.is_retryable() {
                Ok(Action::requeue(ERROR_REQUEUE))
            } else {
                Ok(Action::await_change())
            }
        }
    }
}

async fn resolve(
    resource: &DeferredResource,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, DeferredError> {
    let created = resource.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let timeout = resource.spec.timeout.unwrap_or_default();
    if let Some(left) = remaining_timeout(created, timeout, Utc::now()) {
        pending(resource, namespace, ctx, "waiting for timeout").await?;
        return Ok(Action::requeue(left));
    }

    let applier = ctx.applier(resource, namespace)?;
    let dynamic = applier.dynamic();
    for target in &resource.spec.wait_for {
        let target_ns = target
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| namespace.to_string());
        let found = dynamic
            .get(
                &target.resolved_api_version(),
                &target.kind,
                &target.name,
                Some(target_ns.clone()),
            )
            .await?;
        if found.is_none() {
            debug!(kind = %target.kind, name = %target.name, namespace = %target_ns, "waiting for resource");
            pending(resource, namespace, ctx, "waiting for resource").await?;
            return Ok(Action::requeue(WAIT_FOR_REQUEUE));
        }
    }

    let applied = applier
        .apply_manifest(resource.spec.resource.clone(), namespace)
        .await?;

    let generation = resource.metadata.generation.unwrap_or_default();
    let mut status = resource.status.clone().unwrap_or_default();
    status.owner_reference = owner_reference(&applied);
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_RESOLVED,
            ConditionStatus::True,
            reason::SUCCESS,
            "success",
            generation,
        ),
    );
    remove_condition(&mut status.conditions, CONDITION_FAILED);
    update_status(resource, namespace, ctx, status).await?;

    info!(kind = ?applied.get("kind"), "deferred resource applied");
    Ok(Action::await_change())
}

async fn pending(
    resource: &DeferredResource,
    namespace: &str,
    ctx: &Context,
    message: &str,
) -> Result<(), DeferredError> {
    let generation = resource.metadata.generation.unwrap_or_default();
    let mut status = resource.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_RESOLVED,
            ConditionStatus::False,
            reason::PENDING,
            message,
            generation,
        ),
    );
    update_status(resource, namespace, ctx, status).await
}

async fn update_status(
    resource: &DeferredResource,
    namespace: &str,
    ctx: &Context,
    status: DeferredResourceStatus,
) -> Result<(), DeferredError> {
    if resource.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.client
        .patch_status(
            &resource.name_any(),
            namespace,
            resource.resource_version(),
            &status,
        )
        .await?;
    Ok(())
}

/// Requeue policy for the DeferredResource controller
pub fn error_policy(
    resource: Arc<DeferredResource>,
    error: &DeferredError,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        deferred_resource = %resource.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_conflict() {
        Action::requeue(CONFLICT_REQUEUE)
    } else if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}
