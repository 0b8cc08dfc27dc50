//! Coupling engine
//!
//! Drives plugs and sockets through their lifecycle. A plug pass walks the
//! plug from `created` to `coupled`/`updated`, keeping the socket's coupled
//! set in step. A socket pass marks the socket ready and fans socket changes
//! out to its coupled plugs. Deletion of either side runs the `decoupled`
//! handlers before the finalizer is released.
//!
//! Callers hold the object's lock (see [`Coupler::lock`]) for the whole pass.
//! The plug pass additionally takes the socket's lock while it edits the
//! socket's coupled set; the socket pass never takes plug locks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use integration_common::crd::{
    coupled_plugs_message, find_condition, reason, remove_condition, set_condition, Condition,
    ConditionStatus, CoupledRef, CoupledResultStatus, Interface, NamespacedName, Phase, Plug,
    PlugStatus, Socket, SocketStatus, CONDITION_FAILED, CONDITION_JOINED,
};
use integration_common::Error;

use crate::apparatus::ObjectMeta;
use crate::bus::{Coupling, CouplingEvent, EventBus, Scope, Side, Subject, Topic};
use crate::client::CouplingClient;
use crate::error::CouplerError;
use crate::handlers::{template_context, LifecycleHandler};
use crate::locks::KeyedLocks;
use crate::resolver::{ConfigResolver, ResolveInput};

/// Requeue interval while waiting on the socket
pub const PENDING_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue interval after a retryable failure
pub const RETRY_REQUEUE: Duration = Duration::from_secs(30);

/// Drives plug and socket passes
pub struct Coupler {
    client: Arc<dyn CouplingClient>,
    resolver: ConfigResolver,
    handlers: Arc<dyn LifecycleHandler>,
    bus: Arc<EventBus>,
    locks: KeyedLocks,
    operator_namespace: String,
}

impl Coupler {
    /// Create an engine
    ///
    /// Interfaces referenced without a namespace are looked up in
    /// `operator_namespace`.
    pub fn new(
        client: Arc<dyn CouplingClient>,
        resolver: ConfigResolver,
        handlers: Arc<dyn LifecycleHandler>,
        bus: Arc<EventBus>,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            resolver,
            handlers,
            bus,
            locks: KeyedLocks::new(),
            operator_namespace: operator_namespace.into(),
        }
    }

    /// The bus lifecycle events are published on
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Wait for exclusive ownership of an object
    pub async fn lock(&self, side: Side, namespace: &str, name: &str) -> OwnedMutexGuard<()> {
        self.locks
            .lock(&KeyedLocks::key(side.kind(), namespace, name))
            .await
    }

    /// Forget locks nobody holds
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    // =========================================================================
    // Plug pass
    // =========================================================================

    /// Couple a live plug to its socket, or update an existing coupling
    pub async fn couple_plug(&self, plug: &Plug) -> Result<Action, CouplerError> {
        let (name, namespace) = identity(plug, Side::Plug)?;
        let generation = plug.metadata.generation.unwrap_or_default();
        let mut current = plug.clone();
        let mut status = plug.status.clone().unwrap_or_default();

        if find_condition(&status.conditions, CONDITION_JOINED).is_none() {
            status.phase = Phase::Pending;
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_JOINED,
                    ConditionStatus::False,
                    reason::PLUG_CREATED,
                    "plug created",
                    generation,
                ),
            );
            self.persist_plug(&mut current, &status).await?;
            info!(plug = %name, namespace = %namespace, "plug created");
            self.bus
                .publish(CouplingEvent::Created(Subject::Plug(Arc::new(current.clone()))));
        }

        let was_joined = status.coupled_socket.is_some()
            && find_condition(&status.conditions, CONDITION_JOINED).is_some_and(Condition::is_true);

        let socket_ref = plug.socket_ref();
        let socket_ns = socket_ref.namespace_or(&namespace).to_string();
        let socket = match self.client.get_socket(&socket_ref.name, &socket_ns).await? {
            Some(socket) => socket,
            None => {
                return self
                    .plug_pending(
                        &mut current,
                        status,
                        generation,
                        reason::SOCKET_NOT_CREATED,
                        "waiting for socket to be created",
                    )
                    .await;
            }
        };
        let socket_ready = socket.metadata.deletion_timestamp.is_none()
            && socket.status.as_ref().is_some_and(|s| s.ready);
        if !socket_ready {
            return self
                .plug_pending(
                    &mut current,
                    status,
                    generation,
                    reason::SOCKET_NOT_READY,
                    "waiting for socket to be ready",
                )
                .await;
        }

        let socket = Arc::new(socket);
        let result = self
            .couple_with(&mut current, &mut status, socket.clone(), was_joined, generation)
            .await;
        match result {
            Ok(action) => Ok(action),
            Err(e) if e.is_conflict() => Err(e),
            Err(e) => {
                let broken = was_joined.then(|| detached_coupling(&current, Some(socket)));
                self.fail_plug(&mut current, status, generation, e, broken)
                    .await
            }
        }
    }

    async fn couple_with(
        &self,
        current: &mut Plug,
        status: &mut PlugStatus,
        socket: Arc<Socket>,
        was_joined: bool,
        generation: i64,
    ) -> Result<Action, CouplerError> {
        let (name, namespace) = identity(&*current, Side::Plug)?;
        let (socket_name, _) = identity(&*socket, Side::Socket)?;
        let plug_key = format!("{}/{}", namespace, name);

        let plug_interface = match &current.spec.interface {
            Some(reference) => Some(self.interface(reference).await?),
            None => None,
        };
        let socket_interface = match &socket.spec.interface {
            Some(reference) => Some(self.interface(reference).await?),
            None => None,
        };
        if let Some(expected) = &plug_interface {
            let matches = socket_interface.as_ref().is_some_and(|actual| {
                actual.name_any() == expected.name_any() && actual.namespace() == expected.namespace()
            });
            if !matches {
                return Err(Error::validation_for(
                    plug_key,
                    "plug and socket interface do not match",
                )
                .into());
            }
        }

        if let Some(validation) = &socket.spec.validation {
            if !validation.allows(&namespace) {
                return Err(Error::validation_for(
                    plug_key,
                    format!(
                        "namespace '{}' is not allowed to couple to socket '{}'",
                        namespace, socket_name
                    ),
                )
                .into());
            }
        }

        let uid = current.uid().unwrap_or_default();
        let socket_status = socket.status.clone().unwrap_or_default();
        let joining = !(was_joined && socket_status.has_plug(&uid));
        let limit = socket.spec.limit as usize;
        if joining && limit > 0 {
            let others = socket_status
                .coupled_plugs
                .iter()
                .filter(|p| p.uid != uid)
                .count();
            if others >= limit {
                return Err(Error::validation_for(
                    plug_key,
                    format!("socket limit of {} plugs reached", limit),
                )
                .into());
            }
        }

        status.phase = Phase::Pending;
        let in_process = if joining {
            Condition::new(
                CONDITION_JOINED,
                ConditionStatus::False,
                reason::COUPLING_IN_PROCESS,
                "coupling to socket",
                generation,
            )
        } else {
            Condition::new(
                CONDITION_JOINED,
                ConditionStatus::True,
                reason::UPDATING_IN_PROCESS,
                "updating coupling",
                generation,
            )
        };
        set_condition(&mut status.conditions, in_process);
        self.persist_plug(current, status).await?;

        let topic = if joining { Topic::Coupled } else { Topic::Updated };
        let interface = socket_interface.or(plug_interface);
        let coupling = self
            .resolve_coupling(
                Arc::new(current.clone()),
                socket.clone(),
                interface.as_ref(),
                Scope::Full,
            )
            .await?;

        let plug_side = Arc::new(coupling.for_side(Side::Plug));
        let socket_side = Arc::new(coupling.for_side(Side::Socket));

        self.handlers.handle(&event(topic, plug_side.clone())).await?;
        if let Err(e) = self.handlers.handle(&event(topic, socket_side.clone())).await {
            self.mark_socket_failed(&socket, &e.to_string()).await;
            return Err(e.into());
        }
        self.handlers.apply_results(&plug_side).await?;
        self.handlers.apply_results(&socket_side).await?;

        if joining {
            self.join_socket(&socket, current).await?;
        }
        self.bus.publish(event(topic, plug_side));
        self.bus.publish(event(topic, socket_side));

        status.phase = Phase::Succeeded;
        status.coupled_socket = Some(coupled_ref(&*socket));
        status.coupled_result = Some(CoupledResultStatus {
            plug: coupling.plug_result.clone(),
            socket: coupling.socket_result.clone(),
            observed_generation: generation,
        });
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_JOINED,
                ConditionStatus::True,
                reason::COUPLING_SUCCEEDED,
                "coupling succeeded",
                generation,
            ),
        );
        remove_condition(&mut status.conditions, CONDITION_FAILED);
        self.persist_plug(current, status).await?;

        info!(
            plug = %name,
            namespace = %namespace,
            socket = %socket_name,
            event = %topic,
            "coupling succeeded"
        );
        Ok(Action::await_change())
    }

    /// Decouple a plug that is being deleted and release its finalizer
    pub async fn decouple_plug(&self, plug: &Plug) -> Result<Action, CouplerError> {
        let (name, namespace) = identity(plug, Side::Plug)?;
        let uid = plug.uid().unwrap_or_default();
        let socket_ref = plug.socket_ref();
        let socket_ns = socket_ref.namespace_or(&namespace).to_string();

        let socket = self.client.get_socket(&socket_ref.name, &socket_ns).await?;
        let in_socket = socket
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some_and(|s| s.has_plug(&uid));
        let coupled = in_socket
            || plug
                .status
                .as_ref()
                .is_some_and(|s| s.coupled_socket.is_some());

        if coupled {
            let plug = Arc::new(plug.clone());
            match socket.map(Arc::new) {
                Some(socket) => {
                    let coupling = self.decoupling(plug, socket.clone()).await;
                    let plug_side = Arc::new(coupling.for_side(Side::Plug));
                    let socket_side = Arc::new(coupling.for_side(Side::Socket));
                    self.handlers
                        .handle(&CouplingEvent::Decoupled(plug_side.clone()))
                        .await?;
                    self.handlers
                        .handle(&CouplingEvent::Decoupled(socket_side.clone()))
                        .await?;
                    if in_socket {
                        self.leave_socket(&socket, &uid).await?;
                    }
                    self.bus.publish(CouplingEvent::Decoupled(plug_side));
                    self.bus.publish(CouplingEvent::Decoupled(socket_side));
                }
                None => {
                    debug!(plug = %name, "socket already gone, running plug side only");
                    let coupling = Arc::new(detached_coupling(&plug, None));
                    self.handlers
                        .handle(&CouplingEvent::Decoupled(coupling.clone()))
                        .await?;
                    self.bus.publish(CouplingEvent::Decoupled(coupling));
                }
            }
            info!(plug = %name, namespace = %namespace, "plug decoupled");
        }

        self.bus
            .publish(CouplingEvent::Deleted(Subject::Plug(Arc::new(plug.clone()))));
        self.client
            .remove_finalizer(Side::Plug, &name, &namespace)
            .await?;
        self.locks
            .forget(&KeyedLocks::key(Side::Plug.kind(), &namespace, &name));
        Ok(Action::await_change())
    }

    async fn plug_pending(
        &self,
        current: &mut Plug,
        mut status: PlugStatus,
        generation: i64,
        reason: &str,
        message: &str,
    ) -> Result<Action, CouplerError> {
        status.phase = Phase::Pending;
        remove_condition(&mut status.conditions, CONDITION_FAILED);
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_JOINED, ConditionStatus::False, reason, message, generation),
        );
        self.persist_plug(current, &status).await?;
        debug!(plug = %current.name_any(), reason = %reason, "plug pending");
        Ok(Action::requeue(PENDING_REQUEUE))
    }

    async fn fail_plug(
        &self,
        current: &mut Plug,
        mut status: PlugStatus,
        generation: i64,
        error: CouplerError,
        broken: Option<Coupling>,
    ) -> Result<Action, CouplerError> {
        warn!(plug = %current.name_any(), error = %error, "coupling failed");
        status.phase = Phase::Failed;
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_FAILED,
                ConditionStatus::True,
                reason::ERROR,
                error.to_string(),
                generation,
            ),
        );
        self.persist_plug(current, &status).await?;

        if let Some(coupling) = broken {
            self.bus
                .publish(CouplingEvent::Broken(Arc::new(coupling.for_side(Side::Plug))));
            self.bus
                .publish(CouplingEvent::Broken(Arc::new(coupling.for_side(Side::Socket))));
        }

        if error.is_retryable() {
            Ok(Action::requeue(RETRY_REQUEUE))
        } else {
            Ok(Action::await_change())
        }
    }

    async fn persist_plug(&self, current: &mut Plug, status: &PlugStatus) -> Result<(), CouplerError> {
        if current.status.as_ref() == Some(status) {
            return Ok(());
        }
        let (name, namespace) = identity(&*current, Side::Plug)?;
        *current = self
            .client
            .patch_plug_status(&name, &namespace, current.resource_version(), status)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Socket pass
    // =========================================================================

    /// Mark a live socket ready and propagate its changes to coupled plugs
    pub async fn couple_socket(&self, socket: &Socket) -> Result<Action, CouplerError> {
        let (name, namespace) = identity(socket, Side::Socket)?;
        let generation = socket.metadata.generation.unwrap_or_default();
        let mut current = socket.clone();
        let mut status = socket.status.clone().unwrap_or_default();

        if find_condition(&status.conditions, CONDITION_JOINED).is_none() {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_JOINED,
                    ConditionStatus::False,
                    reason::SOCKET_CREATED,
                    "socket created",
                    generation,
                ),
            );
            self.persist_socket(&mut current, &status).await?;
            info!(socket = %name, namespace = %namespace, "socket created");
            self.bus
                .publish(CouplingEvent::Created(Subject::Socket(Arc::new(current.clone()))));
        }

        let interface = match &socket.spec.interface {
            Some(reference) => match self.interface(reference).await {
                Ok(interface) => Some(interface),
                Err(e) if e.is_conflict() => return Err(e),
                Err(e) => return self.fail_socket(&mut current, status, generation, e).await,
            },
            None => None,
        };

        let changed = status
            .observed_generation
            .is_some_and(|observed| observed != generation);
        if changed && !status.coupled_plugs.is_empty() {
            let shared = Arc::new(current.clone());
            let updated = self
                .update_coupled_plugs(shared, &status.coupled_plugs, interface.as_ref())
                .await;
            if let Err(e) = updated {
                if e.is_conflict() {
                    return Err(e);
                }
                return self.fail_socket(&mut current, status, generation, e).await;
            }
        }

        status.ready = true;
        status.observed_generation = Some(generation);
        let joined = joined_condition(&status, generation);
        set_condition(&mut status.conditions, joined);
        remove_condition(&mut status.conditions, CONDITION_FAILED);
        self.persist_socket(&mut current, &status).await?;

        debug!(
            socket = %name,
            namespace = %namespace,
            plugs = status.coupled_plugs.len(),
            "socket ready"
        );
        Ok(Action::await_change())
    }

    async fn update_coupled_plugs(
        &self,
        socket: Arc<Socket>,
        plugs: &[CoupledRef],
        interface: Option<&Interface>,
    ) -> Result<(), CouplerError> {
        for reference in plugs {
            let Some(plug) = self
                .client
                .get_plug(&reference.name, &reference.namespace)
                .await?
            else {
                debug!(plug = %reference.name, "coupled plug gone, skipping update");
                continue;
            };
            let coupling = self
                .resolve_coupling(Arc::new(plug), socket.clone(), interface, Scope::Status)
                .await?;
            let socket_side = Arc::new(coupling.for_side(Side::Socket));
            let plug_side = Arc::new(coupling.for_side(Side::Plug));
            self.handlers
                .handle(&CouplingEvent::Updated(socket_side.clone()))
                .await?;
            self.handlers
                .handle(&CouplingEvent::Updated(plug_side.clone()))
                .await?;
            self.bus.publish(CouplingEvent::Updated(socket_side));
            self.bus.publish(CouplingEvent::Updated(plug_side));
            info!(
                socket = %socket.name_any(),
                plug = %reference.name,
                plug_namespace = %reference.namespace,
                "socket change applied to plug"
            );
        }
        Ok(())
    }

    /// Decouple every plug from a socket being deleted and release its finalizer
    ///
    /// Each plug is sent back to pending so its next pass waits for a socket.
    pub async fn decouple_socket(&self, socket: &Socket) -> Result<Action, CouplerError> {
        let (name, namespace) = identity(socket, Side::Socket)?;
        let shared = Arc::new(socket.clone());
        let coupled = socket
            .status
            .as_ref()
            .map(|s| s.coupled_plugs.clone())
            .unwrap_or_default();

        for reference in &coupled {
            let Some(plug) = self
                .client
                .get_plug(&reference.name, &reference.namespace)
                .await?
            else {
                continue;
            };
            let plug = Arc::new(plug);
            let coupling = self.decoupling(plug.clone(), shared.clone()).await;
            let socket_side = Arc::new(coupling.for_side(Side::Socket));
            self.handlers
                .handle(&CouplingEvent::Decoupled(socket_side.clone()))
                .await?;
            self.bus.publish(CouplingEvent::Decoupled(socket_side));
            self.detach_plug(&plug).await?;
        }

        if !coupled.is_empty() {
            info!(socket = %name, namespace = %namespace, plugs = coupled.len(), "socket decoupled");
        }
        self.bus
            .publish(CouplingEvent::Deleted(Subject::Socket(shared)));
        self.client
            .remove_finalizer(Side::Socket, &name, &namespace)
            .await?;
        self.locks
            .forget(&KeyedLocks::key(Side::Socket.kind(), &namespace, &name));
        Ok(Action::await_change())
    }

    async fn detach_plug(&self, plug: &Plug) -> Result<(), CouplerError> {
        let generation = plug.metadata.generation.unwrap_or_default();
        let mut current = plug.clone();
        let mut status = plug.status.clone().unwrap_or_default();
        status.phase = Phase::Pending;
        status.coupled_socket = None;
        remove_condition(&mut status.conditions, CONDITION_FAILED);
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_JOINED,
                ConditionStatus::False,
                reason::SOCKET_NOT_CREATED,
                "waiting for socket to be created",
                generation,
            ),
        );
        self.persist_plug(&mut current, &status).await
    }

    async fn fail_socket(
        &self,
        current: &mut Socket,
        mut status: SocketStatus,
        generation: i64,
        error: CouplerError,
    ) -> Result<Action, CouplerError> {
        warn!(socket = %current.name_any(), error = %error, "socket pass failed");
        status.ready = false;
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_FAILED,
                ConditionStatus::True,
                reason::ERROR,
                error.to_string(),
                generation,
            ),
        );
        self.persist_socket(current, &status).await?;
        if error.is_retryable() {
            Ok(Action::requeue(RETRY_REQUEUE))
        } else {
            Ok(Action::await_change())
        }
    }

    async fn persist_socket(
        &self,
        current: &mut Socket,
        status: &SocketStatus,
    ) -> Result<(), CouplerError> {
        if current.status.as_ref() == Some(status) {
            return Ok(());
        }
        let (name, namespace) = identity(&*current, Side::Socket)?;
        *current = self
            .client
            .patch_socket_status(&name, &namespace, current.resource_version(), status)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Socket coupled set, edited from plug passes
    // =========================================================================

    async fn join_socket(&self, socket: &Socket, plug: &Plug) -> Result<(), CouplerError> {
        self.edit_socket(socket, |status, _| {
            status.insert_plug(coupled_ref(plug));
        })
        .await
    }

    async fn leave_socket(&self, socket: &Socket, plug_uid: &str) -> Result<(), CouplerError> {
        self.edit_socket(socket, |status, _| {
            status.remove_plug(plug_uid);
        })
        .await
    }

    async fn edit_socket<F>(&self, socket: &Socket, edit: F) -> Result<(), CouplerError>
    where
        F: FnOnce(&mut SocketStatus, i64),
    {
        let (name, namespace) = identity(socket, Side::Socket)?;
        let _guard = self.lock(Side::Socket, &namespace, &name).await;

        let mut fresh = self
            .client
            .get_socket(&name, &namespace)
            .await?
            .ok_or_else(|| Error::not_found("Socket", format!("{}/{}", namespace, name)))?;
        let generation = fresh.metadata.generation.unwrap_or_default();
        let mut status = fresh.status.clone().unwrap_or_default();
        edit(&mut status, generation);
        let joined = joined_condition(&status, generation);
        set_condition(&mut status.conditions, joined);
        self.persist_socket(&mut fresh, &status).await
    }

    async fn mark_socket_failed(&self, socket: &Socket, message: &str) {
        let Ok((name, namespace)) = identity(socket, Side::Socket) else {
            return;
        };
        let message = message.to_string();
        let result = self
            .edit_socket(socket, |status, generation| {
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_FAILED,
                        ConditionStatus::True,
                        reason::ERROR,
                        message,
                        generation,
                    ),
                );
            })
            .await;
        if let Err(e) = result {
            warn!(socket = %name, namespace = %namespace, error = %e, "could not mark socket failed");
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    async fn interface(&self, reference: &NamespacedName) -> Result<Interface, CouplerError> {
        let namespace = reference.namespace_or(&self.operator_namespace);
        self.client
            .get_interface(&reference.name, namespace)
            .await?
            .ok_or_else(|| {
                Error::not_found("Interface", format!("{}/{}", namespace, reference.name)).into()
            })
    }

    /// Resolve config and results of both sides
    async fn resolve_coupling(
        &self,
        plug: Arc<Plug>,
        socket: Arc<Socket>,
        interface: Option<&Interface>,
        scope: Scope,
    ) -> Result<Coupling, CouplerError> {
        let config_schema = interface.and_then(|i| i.spec.config.as_ref());
        let result_schema = interface.and_then(|i| i.spec.result.as_ref());

        let plug_value = serde_json::to_value(&*plug)?;
        let socket_value = serde_json::to_value(&*socket)?;
        let plug_input = ResolveInput {
            side: Side::Plug,
            object: &plug_value,
            meta: ObjectMeta::of(&*plug),
            sources: &plug.spec.sources,
        };
        let socket_input = ResolveInput {
            side: Side::Socket,
            object: &socket_value,
            meta: ObjectMeta::of(&*socket),
            sources: &socket.spec.sources,
        };

        let plug_config = self
            .resolver
            .resolve_config(&plug_input, config_schema.and_then(|c| c.plug.as_ref()))
            .await?;
        let socket_config = self
            .resolver
            .resolve_config(&socket_input, config_schema.and_then(|c| c.socket.as_ref()))
            .await?;

        let empty = BTreeMap::new();
        let ctx = template_context(
            Some(&plug),
            Some(&socket),
            &plug_config,
            &socket_config,
            &empty,
            &empty,
        )?;
        let plug_result = self
            .resolver
            .resolve_result(
                &plug_input,
                &ctx,
                &plug_config,
                result_schema.and_then(|r| r.plug.as_ref()),
            )
            .await?;
        let socket_result = self
            .resolver
            .resolve_result(
                &socket_input,
                &ctx,
                &socket_config,
                result_schema.and_then(|r| r.socket.as_ref()),
            )
            .await?;

        Ok(Coupling {
            side: Side::Plug,
            scope,
            plug,
            socket: Some(socket),
            plug_config,
            socket_config,
            plug_result,
            socket_result,
        })
    }

    /// Coupling used by `decoupled` handlers
    ///
    /// Config that no longer resolves is left empty so a broken reference
    /// never blocks deletion.
    async fn decoupling(&self, plug: Arc<Plug>, socket: Arc<Socket>) -> Coupling {
        let interface = match &socket.spec.interface {
            Some(reference) => self.interface(reference).await.ok(),
            None => None,
        };
        match self
            .resolve_coupling(plug.clone(), socket.clone(), interface.as_ref(), Scope::Full)
            .await
        {
            Ok(coupling) => coupling,
            Err(e) => {
                warn!(plug = %plug.name_any(), error = %e, "config unavailable while decoupling");
                detached_coupling(&plug, Some(socket))
            }
        }
    }
}

/// Name and namespace of a namespaced object
fn identity<K: ResourceExt>(object: &K, side: Side) -> Result<(String, String), CouplerError> {
    let name = object.name_any();
    match object.namespace() {
        Some(namespace) => Ok((name, namespace)),
        None => Err(CouplerError::MissingNamespace {
            kind: side.kind(),
            name,
        }),
    }
}

fn coupled_ref<K>(object: &K) -> CoupledRef
where
    K: Resource<DynamicType = ()> + ResourceExt,
{
    CoupledRef {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: object.name_any(),
        namespace: object.namespace().unwrap_or_default(),
        uid: object.uid().unwrap_or_default(),
    }
}

/// Status of the socket's Joined condition for its coupled set
fn joined_condition(status: &SocketStatus, generation: i64) -> Condition {
    let count = status.coupled_plugs.len();
    if count == 0 {
        Condition::new(
            CONDITION_JOINED,
            ConditionStatus::False,
            reason::SOCKET_EMPTY,
            coupled_plugs_message(0),
            generation,
        )
    } else {
        Condition::new(
            CONDITION_JOINED,
            ConditionStatus::True,
            reason::SOCKET_COUPLED,
            coupled_plugs_message(count),
            generation,
        )
    }
}

/// Coupling without freshly resolved config, carrying the last known results
fn detached_coupling(plug: &Plug, socket: Option<Arc<Socket>>) -> Coupling {
    let results = plug
        .status
        .as_ref()
        .and_then(|s| s.coupled_result.clone())
        .unwrap_or_default();
    Coupling {
        side: Side::Plug,
        scope: Scope::Full,
        plug: Arc::new(plug.clone()),
        socket,
        plug_config: BTreeMap::new(),
        socket_config: BTreeMap::new(),
        plug_result: results.plug,
        socket_result: results.socket,
    }
}

fn event(topic: Topic, coupling: Arc<Coupling>) -> CouplingEvent {
    match topic {
        Topic::Updated => CouplingEvent::Updated(coupling),
        Topic::Decoupled => CouplingEvent::Decoupled(coupling),
        Topic::Broken => CouplingEvent::Broken(coupling),
        _ => CouplingEvent::Coupled(coupling),
    }
}
