//! sidetrack-operator - drives `Session` objects to convergence.
//!
//! Watches the `Session` custom resource and runs the core reconciliation
//! engine against the cluster: forked workloads, header-scoped mesh
//! routes, and session hosts on gateways appear while a session exists and
//! are unwound when it is deleted. The controller loop owns all retry
//! behavior; the engine itself never sleeps.

mod config;
mod controller;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use kube::Client;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sidetrack_core::{JsonEngine, KubeClient, Orchestrator};

/// sidetrack operator - ephemeral side tracks through an Istio mesh
#[derive(Parser, Debug)]
#[command(name = "sidetrack-operator")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the operator configuration file
    #[arg(short, long, default_value = "sidetrack.toml")]
    config: PathBuf,

    /// Namespace to watch (overrides the config file; default: all)
    #[arg(long)]
    namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mut config =
        config::OperatorConfig::load(&args.config).context("failed to load configuration")?;
    if !args.config.exists() {
        info!(path = ?args.config, "no config file found, using defaults");
    }
    if let Some(namespace) = args.namespace {
        config.namespace = Some(namespace);
    }

    let client = Client::try_default()
        .await
        .context("failed to build cluster client")?;

    let context = controller::Context {
        client: client.clone(),
        cluster: Arc::new(KubeClient::new(client)),
        orchestrator: Orchestrator::with_defaults(Arc::new(JsonEngine)),
        config,
    };

    info!(
        namespace = context.config.namespace.as_deref().unwrap_or("<all>"),
        "sidetrack operator started"
    );
    controller::run(Arc::new(context)).await;
    info!("operator shut down");
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}
