//! Controller runner - builds controller futures
//!
//! Each `build_*` function returns a Vec of boxed futures that the binary
//! runs together. The coupling controllers share one event bus whose
//! advisory events are run by a background dispatcher.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use integration_common::config::{max_concurrent_reconciles, pod_namespace, OperatorEnv};
use integration_common::crd::{DeferredResource, Plug, Socket};
use integration_coupler::bus::EventBus;
use integration_coupler::dispatcher::{Dispatcher, DispatcherConfig};
use integration_coupler::{error_policy, reconcile_plug, reconcile_socket, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Coupling controllers together with their running event dispatcher
pub struct CouplingControllers {
    /// Plug and Socket controller futures
    pub controllers: Vec<ControllerFuture>,
    /// Background dispatcher task; finishes after `cancel` fires
    pub dispatcher: JoinHandle<()>,
}

fn controller_config(env: &dyn OperatorEnv) -> ControllerConfig {
    ControllerConfig::default().concurrency(max_concurrent_reconciles(env))
}

/// Build the Plug and Socket controllers and start the event dispatcher
///
/// Must be called inside a tokio runtime.
pub fn build_coupling_controllers(
    client: Client,
    config: kube::Config,
    env: &dyn OperatorEnv,
    dispatcher_config: DispatcherConfig,
    cancel: CancellationToken,
) -> anyhow::Result<CouplingControllers> {
    let bus = Arc::new(EventBus::new(dispatcher_config.queue_size));
    let operator_namespace = pod_namespace(env);
    tracing::info!(namespace = %operator_namespace, "default Interface namespace");

    let ctx = Arc::new(
        Context::new(client.clone(), config, bus.clone(), operator_namespace)
            .map_err(|e| anyhow::anyhow!("failed to build coupling context: {}", e))?,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        bus,
        ctx.handlers.clone(),
        dispatcher_config.max_workers,
    ))
    .start(cancel);

    let plugs: Api<Plug> = Api::all(client.clone());
    let sockets: Api<Socket> = Api::all(client);

    tracing::info!("- Plug controller");
    tracing::info!("- Socket controller");

    let plug_ctrl = Controller::new(plugs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(controller_config(env))
        .shutdown_on_signal()
        .run(reconcile_plug, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Plug"));

    let socket_ctrl = Controller::new(sockets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(controller_config(env))
        .shutdown_on_signal()
        .run(reconcile_socket, error_policy, ctx)
        .for_each(log_reconcile_result("Socket"));

    Ok(CouplingControllers {
        controllers: vec![Box::pin(plug_ctrl), Box::pin(socket_ctrl)],
        dispatcher,
    })
}

/// Build the DeferredResource controller
pub fn build_deferred_controllers(
    client: Client,
    config: kube::Config,
    env: &dyn OperatorEnv,
) -> anyhow::Result<Vec<ControllerFuture>> {
    let ctx = Arc::new(
        integration_deferred::Context::new(client.clone(), config)
            .map_err(|e| anyhow::anyhow!("failed to build deferred resource context: {}", e))?,
    );
    let resources: Api<DeferredResource> = Api::all(client);

    tracing::info!("- DeferredResource controller");

    Ok(vec![Box::pin(
        Controller::new(resources, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(controller_config(env))
            .shutdown_on_signal()
            .run(
                integration_deferred::reconcile,
                integration_deferred::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("DeferredResource")),
    )])
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
