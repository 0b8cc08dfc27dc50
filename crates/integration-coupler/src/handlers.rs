//! Lifecycle handlers
//!
//! For each lifecycle event the side it concerns gets its apparatus notified
//! and its resources for the matching hook applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use integration_common::crd::{CouplingSources, Plug, Socket};
use integration_common::resource::ApplierSource;
use integration_common::Error;

use crate::apparatus::{Apparatus, ApparatusRequest, ObjectMeta};
use crate::bus::{Coupling, CouplingEvent, Side, Subject, Topic};

/// Runs the side effects attached to lifecycle events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Notify the apparatus and apply the resources of the event's side
    async fn handle(&self, event: &CouplingEvent) -> Result<(), Error>;

    /// Apply the result resources of the coupling's side
    async fn apply_results(&self, coupling: &Coupling) -> Result<(), Error>;
}

/// Template context for a coupling
///
/// Missing objects are `null` and missing maps are empty so templates can
/// test for them.
pub fn template_context(
    plug: Option<&Plug>,
    socket: Option<&Socket>,
    plug_config: &BTreeMap<String, String>,
    socket_config: &BTreeMap<String, String>,
    plug_result: &BTreeMap<String, String>,
    socket_result: &BTreeMap<String, String>,
) -> Result<Value, Error> {
    Ok(json!({
        "plug": serde_json::to_value(plug)?,
        "socket": serde_json::to_value(socket)?,
        "plugConfig": plug_config,
        "socketConfig": socket_config,
        "plugResult": plug_result,
        "socketResult": socket_result,
    }))
}

/// Template context of a coupling event
pub fn coupling_context(coupling: &Coupling) -> Result<Value, Error> {
    template_context(
        Some(&coupling.plug),
        coupling.socket.as_deref(),
        &coupling.plug_config,
        &coupling.socket_config,
        &coupling.plug_result,
        &coupling.socket_result,
    )
}

/// Apparatus request describing a coupling
pub fn coupling_request(coupling: &Coupling) -> Result<ApparatusRequest, Error> {
    Ok(ApparatusRequest {
        plug: Some(serde_json::to_value(&*coupling.plug)?),
        socket: coupling.socket.as_deref().map(serde_json::to_value).transpose()?,
        plug_config: Some(coupling.plug_config.clone()),
        socket_config: Some(coupling.socket_config.clone()),
        plug_meta: Some(ObjectMeta::of(&*coupling.plug)),
        socket_meta: coupling.socket.as_deref().map(ObjectMeta::of),
        ..Default::default()
    })
}

/// Handlers backed by the apparatus client and the resource appliers
///
/// Resources are applied as the side's `serviceAccountName` when it names one.
pub struct Handlers {
    apparatus: Arc<dyn Apparatus>,
    appliers: Arc<dyn ApplierSource>,
}

impl Handlers {
    /// Create handlers
    pub fn new(apparatus: Arc<dyn Apparatus>, appliers: Arc<dyn ApplierSource>) -> Self {
        Self { apparatus, appliers }
    }

    async fn run(
        &self,
        topic: Topic,
        sources: &CouplingSources,
        namespace: &str,
        request: ApparatusRequest,
        ctx: &Value,
    ) -> Result<(), Error> {
        if let Some(apparatus) = &sources.apparatus {
            self.apparatus
                .notify(&apparatus.endpoint, topic, request)
                .await?;
        }
        let touched = self
            .appliers
            .applier_for(namespace, sources.service_account_name.as_deref())?
            .process_resources(&sources.resources, topic.hook(), ctx, namespace)
            .await?;
        if !touched.is_empty() {
            info!(event = %topic, count = touched.len(), "applied lifecycle resources");
        }
        Ok(())
    }
}

fn side_of(coupling: &Coupling) -> Option<(&CouplingSources, String)> {
    match coupling.side {
        Side::Plug => Some((
            &coupling.plug.spec.sources,
            coupling.plug.namespace().unwrap_or_default(),
        )),
        Side::Socket => coupling
            .socket
            .as_deref()
            .map(|s| (&s.spec.sources, s.namespace().unwrap_or_default())),
    }
}

#[async_trait]
impl LifecycleHandler for Handlers {
    async fn handle(&self, event: &CouplingEvent) -> Result<(), Error> {
        let topic = event.topic();
        debug!(event = %topic, side = %event.side(), key = %event.key(), "handling lifecycle event");

        match event {
            CouplingEvent::Created(subject) | CouplingEvent::Deleted(subject) => {
                let empty = BTreeMap::new();
                match subject {
                    Subject::Plug(plug) => {
                        let ctx = template_context(Some(plug), None, &empty, &empty, &empty, &empty)?;
                        let request = ApparatusRequest {
                            plug: Some(serde_json::to_value(&**plug)?),
                            plug_meta: Some(ObjectMeta::of(&**plug)),
                            ..Default::default()
                        };
                        let namespace = plug.namespace().unwrap_or_default();
                        self.run(topic, &plug.spec.sources, &namespace, request, &ctx)
                            .await
                    }
                    Subject::Socket(socket) => {
                        let ctx =
                            template_context(None, Some(socket), &empty, &empty, &empty, &empty)?;
                        let request = ApparatusRequest {
                            socket: Some(serde_json::to_value(&**socket)?),
                            socket_meta: Some(ObjectMeta::of(&**socket)),
                            ..Default::default()
                        };
                        let namespace = socket.namespace().unwrap_or_default();
                        self.run(topic, &socket.spec.sources, &namespace, request, &ctx)
                            .await
                    }
                }
            }
            CouplingEvent::Coupled(coupling)
            | CouplingEvent::Updated(coupling)
            | CouplingEvent::Decoupled(coupling)
            | CouplingEvent::Broken(coupling) => {
                let Some((sources, namespace)) = side_of(coupling) else {
                    debug!(event = %topic, "socket gone, nothing to run on its side");
                    return Ok(());
                };
                let ctx = coupling_context(coupling)?;
                let request = coupling_request(coupling)?;
                self.run(topic, sources, &namespace, request, &ctx).await
            }
        }
    }

    async fn apply_results(&self, coupling: &Coupling) -> Result<(), Error> {
        let Some((sources, namespace)) = side_of(coupling) else {
            return Ok(());
        };
        if sources.result_resources.is_empty() {
            return Ok(());
        }
        let ctx = coupling_context(coupling)?;
        let applier = self
            .appliers
            .applier_for(&namespace, sources.service_account_name.as_deref())?;
        for action in &sources.result_resources {
            applier.process_action(action, &ctx, &namespace).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apparatus::MockApparatus;
    use crate::bus::tests::sample_plug;
    use crate::bus::Scope;
    use crate::resolver::tests::MockDynamic;
    use integration_common::crd::{
        NamespacedName, Resource, ResourceAction, SocketSpec, SpecApparatus, When,
    };
    use integration_common::resource::{ResourceApplier, SharedApplier};
    use std::sync::Mutex;

    fn shared(dynamic: MockDynamic) -> Arc<SharedApplier> {
        Arc::new(SharedApplier::new(ResourceApplier::new(Arc::new(dynamic))))
    }

    /// Hands out one applier, recording the identity asked for
    struct AccountRecorder {
        applier: Arc<ResourceApplier>,
        accounts: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ApplierSource for AccountRecorder {
        fn applier_for(
            &self,
            namespace: &str,
            service_account: Option<&str>,
        ) -> Result<Arc<ResourceApplier>, Error> {
            self.accounts
                .lock()
                .expect("mutex should not be poisoned")
                .push((namespace.to_string(), service_account.map(str::to_string)));
            Ok(self.applier.clone())
        }
    }

    fn coupled_config_map(when: When) -> Resource {
        Resource {
            action: ResourceAction {
                template: Some(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "{{ plug.metadata.name }}-db" },
                    "data": { "HOST": "{{ socketConfig.host }}" }
                })),
                ..Default::default()
            },
            retain_when_decoupled: false,
            when: vec![when],
        }
    }

    fn socket() -> Socket {
        let mut socket = Socket::new("db", SocketSpec::default());
        socket.metadata.namespace = Some("data".to_string());
        socket
    }

    fn coupling(side: Side, plug: Plug) -> Coupling {
        Coupling {
            side,
            scope: Scope::Full,
            plug: Arc::new(plug),
            socket: Some(Arc::new(socket())),
            plug_config: BTreeMap::new(),
            socket_config: BTreeMap::from([("host".to_string(), "10.0.0.5".to_string())]),
            plug_result: BTreeMap::new(),
            socket_result: BTreeMap::new(),
        }
    }

    fn applying_dynamic(expected_ns: &'static str) -> MockDynamic {
        let mut dynamic = MockDynamic::new();
        dynamic
            .expect_apply()
            .withf(move |manifest, ns| {
                ns == expected_ns
                    && manifest["metadata"]["name"] == "app-db"
                    && manifest["data"]["HOST"] == "10.0.0.5"
            })
            .times(1)
            .returning(|mut manifest, ns| {
                manifest["metadata"]["namespace"] = json!(ns);
                Ok(manifest)
            });
        dynamic
            .expect_get()
            .returning(|_, _, _, _| Ok(Some(json!({}))));
        dynamic
    }

    #[tokio::test]
    async fn story_coupled_event_applies_plug_resources_and_notifies_apparatus() {
        let mut plug = sample_plug();
        plug.spec.sources.resources = vec![
            coupled_config_map(When::Coupled),
            coupled_config_map(When::Decoupled),
        ];
        plug.spec.sources.apparatus = Some(SpecApparatus {
            endpoint: "app-apparatus".to_string(),
            idle_timeout: None,
        });

        let mut apparatus = MockApparatus::new();
        apparatus
            .expect_notify()
            .withf(|endpoint, topic, request| {
                endpoint == "app-apparatus"
                    && *topic == Topic::Coupled
                    && request.socket_meta.as_ref().map(|m| m.name.as_str()) == Some("db")
                    && request.socket_config.as_ref().map(|c| c["host"].as_str()) == Some("10.0.0.5")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let handlers = Handlers::new(
            Arc::new(apparatus),
            shared(applying_dynamic("apps")),
        );
        let event = CouplingEvent::Coupled(Arc::new(coupling(Side::Plug, plug)));
        handlers.handle(&event).await.unwrap();
    }

    #[tokio::test]
    async fn story_socket_side_uses_socket_sources() {
        let mut plug = sample_plug();
        plug.spec.sources.resources = vec![coupled_config_map(When::Changed)];

        let mut coupling = coupling(Side::Socket, plug);
        let mut socket = socket();
        socket.spec.sources.resources = vec![coupled_config_map(When::Changed)];
        coupling.socket = Some(Arc::new(socket));

        // Only the socket's resource runs, in the socket's namespace
        let handlers = Handlers::new(
            Arc::new(MockApparatus::new()),
            shared(applying_dynamic("data")),
        );
        handlers
            .handle(&CouplingEvent::Updated(Arc::new(coupling)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_plug_resources_apply_as_its_service_account() {
        let mut plug = sample_plug();
        plug.spec.sources.service_account_name = Some("deployer".to_string());
        plug.spec.sources.resources = vec![coupled_config_map(When::Coupled)];
        plug.spec.sources.result_resources = vec![ResourceAction::default()];

        let appliers = Arc::new(AccountRecorder {
            applier: Arc::new(ResourceApplier::new(Arc::new(applying_dynamic("apps")))),
            accounts: Mutex::new(Vec::new()),
        });
        let handlers = Handlers::new(Arc::new(MockApparatus::new()), appliers.clone());
        let coupling = Arc::new(coupling(Side::Plug, plug));
        handlers
            .handle(&CouplingEvent::Coupled(coupling.clone()))
            .await
            .unwrap();
        handlers.apply_results(&coupling).await.unwrap();

        let deployer = ("apps".to_string(), Some("deployer".to_string()));
        assert_eq!(*appliers.accounts.lock().unwrap(), vec![deployer.clone(), deployer]);
    }

    #[tokio::test]
    async fn story_apparatus_failure_surfaces() {
        let mut plug = sample_plug();
        plug.spec.sources.apparatus = Some(SpecApparatus {
            endpoint: "app-apparatus".to_string(),
            idle_timeout: None,
        });
        let mut apparatus = MockApparatus::new();
        apparatus
            .expect_notify()
            .returning(|endpoint, _, _| Err(Error::apparatus(endpoint, "connection refused")));

        let handlers = Handlers::new(
            Arc::new(apparatus),
            shared(MockDynamic::new()),
        );
        let event = CouplingEvent::Created(Subject::Plug(Arc::new(plug)));
        assert!(handlers.handle(&event).await.is_err());
    }

    #[tokio::test]
    async fn story_missing_socket_skips_socket_side() {
        let mut coupling = coupling(Side::Socket, sample_plug());
        coupling.socket = None;

        let handlers = Handlers::new(
            Arc::new(MockApparatus::new()),
            shared(MockDynamic::new()),
        );
        handlers
            .handle(&CouplingEvent::Decoupled(Arc::new(coupling)))
            .await
            .unwrap();
    }

    #[test]
    fn test_template_context_shape() {
        let plug = sample_plug();
        let empty = BTreeMap::new();
        let ctx = template_context(Some(&plug), None, &empty, &empty, &empty, &empty).unwrap();
        assert_eq!(ctx["plug"]["metadata"]["name"], "app");
        assert!(ctx["socket"].is_null());
        assert!(ctx["socketConfig"].as_object().unwrap().is_empty());
        assert_eq!(
            ctx["plug"]["spec"]["socket"],
            serde_json::to_value(NamespacedName::new("db", None)).unwrap()
        );
    }
}
