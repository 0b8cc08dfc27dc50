//! Integration Operator - couples Plugs to Sockets across a cluster

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use integration_common::config::OsEnv;
use integration_common::crd::{DeferredResource, Interface, Plug, Socket};
use integration_common::kube_utils::infer_config_with_timeout;
use integration_coupler::bus::DEFAULT_QUEUE_SIZE;
use integration_coupler::dispatcher::{DispatcherConfig, DEFAULT_MAX_WORKERS};
use integration_operator::controller_runner::{build_coupling_controllers, build_deferred_controllers};
use integration_operator::startup::ensure_crds;

/// Integration operator - CRD-driven Plug/Socket coupling for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "integration-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Plugs, Sockets and DeferredResources and reconciles them.
    Controller(ControllerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Concurrent runs of advisory lifecycle handlers
    #[arg(long, env = "MAX_WORKERS", default_value_t = DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// Capacity of each event bus subscriber queue
    #[arg(long, env = "QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_SIZE)]
    queue_size: usize,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [Interface::crd(), Socket::crd(), Plug::crd(), DeferredResource::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Integration operator starting...");

    let config = infer_config_with_timeout(Duration::from_secs(10), Duration::from_secs(30))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load Kubernetes config: {}", e))?;
    let client = kube::Client::try_from(config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds(&client).await?;

    let env = OsEnv;
    let cancel = CancellationToken::new();
    let dispatcher_config = DispatcherConfig {
        max_workers: args.max_workers,
        queue_size: args.queue_size,
    };

    tracing::info!("Starting controllers:");
    let coupling = build_coupling_controllers(
        client.clone(),
        config.clone(),
        &env,
        dispatcher_config,
        cancel.clone(),
    )?;
    let mut controllers = coupling.controllers;
    controllers.extend(build_deferred_controllers(client, config, &env)?);

    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped, shutting down event dispatcher");
    cancel.cancel();
    if let Err(e) = coupling.dispatcher.await {
        tracing::warn!(error = %e, "event dispatcher task failed");
    }

    tracing::info!("Integration operator shutting down");
    Ok(())
}
