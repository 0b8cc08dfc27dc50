//! Plug and Socket controllers
//!
//! Each reconcile serializes on the object's lock, handles deletion behind
//! the finalizer, adds the finalizer to live objects and skips notifications
//! that carry nothing new before handing over to the [`Coupler`].

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, instrument};

use integration_common::crd::{
    find_condition, Condition, Phase, Plug, Socket, CONDITION_FAILED, CONDITION_JOINED,
};
use integration_common::kube_utils::{has_finalizer, KubeDynamicClient};
use integration_common::resource::ImpersonatingAppliers;
use integration_common::FINALIZER;

use crate::apparatus::HttpApparatus;
use crate::bus::{EventBus, Side};
use crate::client::{CouplingClient, KubeCouplingClient};
use crate::engine::Coupler;
use crate::error::CouplerError;
use crate::handlers::{Handlers, LifecycleHandler};
use crate::resolver::ConfigResolver;

/// Requeue interval after an optimistic concurrency conflict
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue interval after any other retryable error
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Controller context shared by the plug and socket controllers
pub struct Context {
    /// Cluster access for plugs and sockets
    pub client: Arc<dyn CouplingClient>,
    /// Coupling engine
    pub coupler: Arc<Coupler>,
    /// Lifecycle handlers, also run by the event dispatcher
    pub handlers: Arc<dyn LifecycleHandler>,
}

impl Context {
    /// Wire the production clients together
    ///
    /// `config` is the client's own config, used to impersonate the
    /// ServiceAccounts plugs and sockets name.
    pub fn new(
        client: Client,
        config: kube::Config,
        bus: Arc<EventBus>,
        operator_namespace: impl Into<String>,
    ) -> Result<Self, CouplerError> {
        let coupling_client: Arc<dyn CouplingClient> = Arc::new(KubeCouplingClient::new(client.clone()));
        let dynamic = Arc::new(KubeDynamicClient::new(client));
        let apparatus = Arc::new(HttpApparatus::new()?);
        let appliers = Arc::new(ImpersonatingAppliers::new(config)?);

        let handlers: Arc<dyn LifecycleHandler> = Arc::new(Handlers::new(apparatus.clone(), appliers));
        let resolver = ConfigResolver::new(coupling_client.clone(), dynamic, apparatus);
        let coupler = Arc::new(Coupler::new(
            coupling_client.clone(),
            resolver,
            handlers.clone(),
            bus,
            operator_namespace,
        ));

        Ok(Self {
            client: coupling_client,
            coupler,
            handlers,
        })
    }

    /// Context over mocked cluster access and handlers
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn CouplingClient>,
        handlers: Arc<dyn LifecycleHandler>,
    ) -> Self {
        use crate::apparatus::MockApparatus;
        use crate::resolver::tests::MockDynamic;

        let resolver = ConfigResolver::new(
            client.clone(),
            Arc::new(MockDynamic::new()),
            Arc::new(MockApparatus::new()),
        );
        let coupler = Arc::new(Coupler::new(
            client.clone(),
            resolver,
            handlers.clone(),
            Arc::new(EventBus::default()),
            "kube-system",
        ));
        Self {
            client,
            coupler,
            handlers,
        }
    }
}

fn namespace_of<K: ResourceExt>(object: &K, side: Side) -> Result<String, CouplerError> {
    object
        .namespace()
        .ok_or_else(|| CouplerError::MissingNamespace {
            kind: side.kind(),
            name: object.name_any(),
        })
}

/// Whether the plug's last pass already covered its current generation
pub fn plug_is_current(plug: &Plug) -> bool {
    let Some(status) = &plug.status else {
        return false;
    };
    let generation = plug.metadata.generation.unwrap_or_default();
    let joined = find_condition(&status.conditions, CONDITION_JOINED)
        .is_some_and(|c| c.is_true() && c.observed_generation == generation);
    let results = status
        .coupled_result
        .as_ref()
        .is_some_and(|r| r.observed_generation == generation);
    status.phase == Phase::Succeeded && joined && results
}

/// Whether the socket's last pass already covered its current generation
pub fn socket_is_current(socket: &Socket) -> bool {
    let Some(status) = &socket.status else {
        return false;
    };
    status.ready
        && status.observed_generation == socket.metadata.generation
        && find_condition(&status.conditions, CONDITION_FAILED)
            .map_or(true, |c| !Condition::is_true(c))
}

/// Reconcile a Plug
#[instrument(skip(plug, ctx), fields(plug = %plug.name_any()))]
pub async fn reconcile_plug(plug: Arc<Plug>, ctx: Arc<Context>) -> Result<Action, CouplerError> {
    let name = plug.name_any();
    let namespace = namespace_of(&*plug, Side::Plug)?;
    let _guard = ctx.coupler.lock(Side::Plug, &namespace, &name).await;

    if plug.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&*plug, FINALIZER) {
            return ctx.coupler.decouple_plug(&plug).await;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&*plug, FINALIZER) {
        ctx.client
            .add_finalizer(Side::Plug, &name, &namespace)
            .await?;
        debug!(namespace = %namespace, "added finalizer, waiting for the update");
        return Ok(Action::await_change());
    }

    if plug_is_current(&plug) {
        debug!(namespace = %namespace, "plug already coupled at this generation");
        return Ok(Action::await_change());
    }

    ctx.coupler.couple_plug(&plug).await
}

/// Reconcile a Socket
#[instrument(skip(socket, ctx), fields(socket = %socket.name_any()))]
pub async fn reconcile_socket(
    socket: Arc<Socket>,
    ctx: Arc<Context>,
) -> Result<Action, CouplerError> {
    let name = socket.name_any();
    let namespace = namespace_of(&*socket, Side::Socket)?;
    let _guard = ctx.coupler.lock(Side::Socket, &namespace, &name).await;

    if socket.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&*socket, FINALIZER) {
            return ctx.coupler.decouple_socket(&socket).await;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&*socket, FINALIZER) {
        ctx.client
            .add_finalizer(Side::Socket, &name, &namespace)
            .await?;
        debug!(namespace = %namespace, "added finalizer, waiting for the update");
        return Ok(Action::await_change());
    }

    if socket_is_current(&socket) {
        debug!(namespace = %namespace, "socket already processed at this generation");
        return Ok(Action::await_change());
    }

    ctx.coupler.couple_socket(&socket).await
}

/// Requeue policy shared by the plug and socket controllers
pub fn error_policy<K: ResourceExt>(object: Arc<K>, error: &CouplerError, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        name = %object.name_any(),
        namespace = ?object.namespace(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockCouplingClient;
    use crate::engine::tests::{plug, ready_socket};
    use crate::handlers::MockLifecycleHandler;
    use integration_common::crd::{
        reason, ConditionStatus, CoupledResultStatus, PlugStatus, SocketStatus,
    };
    use integration_common::Error;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn context(client: MockCouplingClient) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(client),
            Arc::new(MockLifecycleHandler::new()),
        ))
    }

    fn with_finalizer(mut plug: Plug) -> Plug {
        plug.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        plug
    }

    fn coupled(mut plug: Plug) -> Plug {
        plug.status = Some(PlugStatus {
            phase: Phase::Succeeded,
            conditions: vec![Condition::new(
                CONDITION_JOINED,
                ConditionStatus::True,
                reason::COUPLING_SUCCEEDED,
                "coupling succeeded",
                1,
            )],
            coupled_socket: None,
            coupled_result: Some(CoupledResultStatus {
                observed_generation: 1,
                ..Default::default()
            }),
        });
        plug
    }

    fn deleting(mut plug: Plug) -> Plug {
        plug.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        plug
    }

    // =========================================================================
    // Plug front
    // =========================================================================

    #[tokio::test]
    async fn story_live_plug_gets_finalizer_first() {
        let mut client = MockCouplingClient::new();
        client
            .expect_add_finalizer()
            .withf(|side, name, namespace| *side == Side::Plug && name == "app" && namespace == "apps")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile_plug(Arc::new(plug()), context(client)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_redundant_plug_notification_is_skipped() {
        // No expectations: any cluster call would panic
        let client = MockCouplingClient::new();
        let action = reconcile_plug(Arc::new(coupled(with_finalizer(plug()))), context(client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_spec_change_runs_a_pass() {
        let mut client = MockCouplingClient::new();
        client.expect_get_socket().times(1).returning(|_, _| Ok(None));
        client
            .expect_patch_plug_status()
            .returning(|_, _, _, status| {
                let mut updated = plug();
                updated.status = Some(status.clone());
                Ok(updated)
            });

        let mut source = coupled(with_finalizer(plug()));
        source.metadata.generation = Some(2);
        reconcile_plug(Arc::new(source), context(client)).await.unwrap();
    }

    #[tokio::test]
    async fn story_deleting_plug_without_finalizer_is_left_alone() {
        let client = MockCouplingClient::new();
        let action = reconcile_plug(Arc::new(deleting(plug())), context(client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_deleting_plug_releases_finalizer() {
        let mut client = MockCouplingClient::new();
        client.expect_get_socket().returning(|_, _| Ok(None));
        client
            .expect_remove_finalizer()
            .withf(|side, _, _| *side == Side::Plug)
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile_plug(Arc::new(deleting(with_finalizer(plug()))), context(client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_plug_without_namespace_is_rejected() {
        let mut source = plug();
        source.metadata.namespace = None;
        let err = reconcile_plug(Arc::new(source), context(MockCouplingClient::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CouplerError::MissingNamespace { kind: "Plug", .. }));
    }

    // =========================================================================
    // Socket front
    // =========================================================================

    #[tokio::test]
    async fn story_processed_socket_is_skipped() {
        let mut socket = ready_socket();
        socket.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        let action = reconcile_socket(Arc::new(socket), context(MockCouplingClient::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_live_socket_gets_finalizer_first() {
        let mut client = MockCouplingClient::new();
        client
            .expect_add_finalizer()
            .withf(|side, _, _| *side == Side::Socket)
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile_socket(Arc::new(ready_socket()), context(client))
            .await
            .unwrap();
    }

    #[test]
    fn test_failed_socket_is_not_current() {
        let mut socket = ready_socket();
        socket.status = Some(SocketStatus {
            ready: true,
            observed_generation: Some(1),
            conditions: vec![Condition::new(
                CONDITION_FAILED,
                ConditionStatus::True,
                reason::ERROR,
                "boom",
                1,
            )],
            ..Default::default()
        });
        assert!(!socket_is_current(&socket));
    }

    // =========================================================================
    // Error policy
    // =========================================================================

    #[test]
    fn test_error_policy_requeues_by_error_class() {
        let ctx = context(MockCouplingClient::new());
        let object = Arc::new(plug());

        let conflict = CouplerError::from(Error::Conflict {
            resource: "apps/app".to_string(),
            message: "the object has been modified".to_string(),
        });
        assert_eq!(
            error_policy(object.clone(), &conflict, ctx.clone()),
            Action::requeue(CONFLICT_REQUEUE)
        );

        let transient = CouplerError::from(Error::apparatus("http://db", "timed out"));
        assert_eq!(
            error_policy(object.clone(), &transient, ctx.clone()),
            Action::requeue(ERROR_REQUEUE)
        );

        let invalid = CouplerError::from(Error::validation("bad spec"));
        assert_eq!(error_policy(object, &invalid, ctx), Action::await_change());
    }
}
