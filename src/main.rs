//! EC2 Monitor Exporter: Prometheus exporter for cloud instance counts.
//!
//! Runs one poller per configured (zone, region) pair. Each poller keeps
//! listing instances, filters them by status and tags, and queues one
//! labeled fact per match. A scrape of `/metrics` drains every queue and
//! reports `ec2_number_instances` grouped by identical label sets.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod collector;
mod config;
mod filter;
mod poller;
mod provider;
mod server;
#[cfg(test)]
mod testutil;

use collector::Aggregator;
use poller::{PollerSettings, PollerWorker};

#[derive(Debug, Parser)]
#[command(name = "ec2monitor-exporter", version, about)]
struct Args {
    /// Port for the metrics endpoint
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// YAML configuration file (defaults to config.yml next to the binary)
    #[arg(short = 'f', long)]
    config_file: Option<PathBuf>,

    /// Pause between two full listings of a region, in seconds
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("📊 EC2 Monitor Exporter v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // ── Configuration ───────────────────────────────────────────────
    let config_path = args.config_file.unwrap_or_else(config::default_config_path);
    let specs = config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    info!(
        config = %config_path.display(),
        pollers = specs.len(),
        "Configuration loaded"
    );

    // ── Pollers ─────────────────────────────────────────────────────
    let settings = PollerSettings {
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        ..PollerSettings::default()
    };
    let mut pollers = Vec::with_capacity(specs.len());
    for spec in specs {
        let connector = provider::connector_for(spec.provider);
        let worker = Arc::new(PollerWorker::new(spec, connector, settings.clone()));
        worker.start().context("Failed to start poller")?;
        pollers.push(worker);
    }

    // ── Registry ────────────────────────────────────────────────────
    let registry = prometheus::Registry::new();
    registry
        .register(Box::new(Aggregator::new(hostname(), pollers.clone())))
        .context("Failed to register aggregator")?;

    // ── HTTP Server ─────────────────────────────────────────────────
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let state = server::AppState::new(Arc::new(registry), pollers.clone());

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(port = args.port, "Exporter ready — all pollers running");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let served = server::run(addr, state, shutdown_signal()).await;

    // ── Shutdown ────────────────────────────────────────────────────
    // Signal everyone first so the stop timeouts overlap.
    for worker in &pollers {
        worker.close();
    }
    let mut stuck = 0;
    for worker in &pollers {
        if !worker.stop().await {
            stuck += 1;
        }
    }
    if stuck > 0 {
        warn!(stuck, "Some pollers did not stop in time");
    }
    info!("👋 Exporter stopped");

    served
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ec2monitor_exporter=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
