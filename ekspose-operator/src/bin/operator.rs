//! ekspose operator binary.
//!
//! Watches Deployments and keeps a Service and an Ingress for each of them.

use anyhow::{Context, Result};
use clap::Parser;
use ekspose_operator::controller::Controller;
use ekspose_operator::observability::{TracingConfig, init_tracing, verbosity_filter};
use ekspose_operator::{ControllerConfig, KubeClusterApi, deployment_watch};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Expose every Deployment through a Service and an Ingress.
#[derive(Parser)]
#[command(name = "ekspose-operator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a single kubeconfig file. Falls back to the in-cluster config
    /// if it cannot be loaded. Without it the standard `KUBECONFIG` lookup
    /// and in-cluster detection apply.
    #[arg(long, env = "EKSPOSE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Only watch Deployments in this namespace
    #[arg(short, long, env = "EKSPOSE_NAMESPACE")]
    namespace: Option<String>,

    /// Number of concurrent workers
    #[arg(short, long, env = "EKSPOSE_WORKERS")]
    workers: Option<usize>,

    /// ingressClassName set on created Ingresses
    #[arg(long, env = "EKSPOSE_INGRESS_CLASS")]
    ingress_class: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose)?;

    let mut config = ControllerConfig::from_env();
    if let Some(namespace) = args.namespace {
        config = config.namespace(namespace);
    }
    if let Some(workers) = args.workers {
        config = config.workers(workers);
    }
    if let Some(class) = args.ingress_class {
        config = config.ingress_class(class);
    }

    tracing::info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        workers = config.workers,
        "Starting ekspose operator"
    );

    let client = connect(args.kubeconfig.as_deref()).await?;
    tracing::info!("Connected to Kubernetes cluster");

    let (cache, watch) = deployment_watch(client.clone(), config.namespace.as_deref());
    let controller = Controller::new(
        config,
        Arc::new(KubeClusterApi::new(client)),
        Arc::new(cache),
    )?;

    let stop = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(stop.clone()));
    let watch_task = tokio::spawn(watch.run(controller.router(), stop.clone()));

    let result = controller.run(stop.clone()).await;
    stop.cancel();
    if let Err(e) = watch_task.await {
        tracing::error!(error = %e, "Deployment watch task failed");
    }

    result?;
    tracing::info!("ekspose operator stopped");
    Ok(())
}

fn setup_logging(verbose: u8) -> Result<()> {
    let mut builder = TracingConfig::builder();
    if let Some(filter) = verbosity_filter(verbose) {
        builder = builder.log_filter(filter);
    }
    init_tracing(builder.build())
}

/// Build a client from `kubeconfig`, or from the in-cluster service account
/// when the file is unusable. Without a path the usual inference applies.
async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => match load_kubeconfig(path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not load kubeconfig, trying in-cluster config"
                );
                Config::incluster().context("Failed to load in-cluster config")?
            }
        },
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes config")?,
    };

    Client::try_from(config).context("Failed to create Kubernetes client")
}

async fn load_kubeconfig(path: &Path) -> Result<Config> {
    let kubeconfig = Kubeconfig::read_from(path)?;
    Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
}

async fn shutdown_on_signal(stop: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Received Ctrl+C"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
            },
            _ = stop.cancelled() => return,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Received Ctrl+C"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
            },
            _ = stop.cancelled() => return,
        }
    }

    stop.cancel();
}
