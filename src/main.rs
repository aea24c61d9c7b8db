//! Routing decision service.
//!
//! Loads a routing configuration, exposes health probes and optional
//! Prometheus metrics, and keeps running until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use traffic_router::{health, load_config, metrics, Router, RuleTable};

#[derive(Debug, Parser)]
#[command(name = "traffic-router", version, about = "Weighted traffic routing engine")]
struct Args {
    /// Routing configuration file (.yaml, .yml or .json).
    #[arg(short, long)]
    config: PathBuf,

    /// Address of the health probe server.
    #[arg(long, default_value = "0.0.0.0:15021")]
    health_listen: SocketAddr,

    /// Address of the Prometheus metrics listener. Disabled if unset.
    #[arg(long)]
    metrics_listen: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config.display(), "traffic-router starting");

    let config = load_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let router = Arc::new(Router::new(Arc::new(RuleTable::new())));
    let version = router
        .apply_config(&config)
        .context("invalid routing configuration")?;

    if args.check {
        tracing::info!(hosts = config.hosts.len(), "configuration is valid");
        return Ok(());
    }
    tracing::info!(hosts = config.hosts.len(), version = version, "configuration loaded");

    if let Some(listen) = &args.metrics_listen {
        metrics::init_prometheus(listen).map_err(anyhow::Error::msg)?;
        tracing::info!(addr = %listen, "metrics exporter listening");
    }

    let health_task = tokio::spawn(health::start_health_server(
        args.health_listen,
        Arc::clone(&router),
    ));

    tokio::select! {
        result = health_task => {
            result
                .context("health server task failed")?
                .context("health server stopped")?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("shutting down");
        }
    }

    Ok(())
}
