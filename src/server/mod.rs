//! HTTP server: Prometheus scrape endpoint plus a JSON health view.
//!
//! Routes:
//! - `GET /metrics` runs one aggregation pass through the registry
//! - `GET /health` lists every poller's lifecycle state and health record
//! - `GET /` is a landing page
//!
//! Read-only. Nothing here mutates poller state apart from the queue
//! drain that a scrape performs.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::poller::{HealthSnapshot, PollerWorker};

// ── State ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    pollers: Arc<Vec<Arc<PollerWorker>>>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, pollers: Vec<Arc<PollerWorker>>) -> Self {
        Self {
            registry,
            pollers: Arc::new(pollers),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

// ── Server ──────────────────────────────────────────────────────────

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn run<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve(listener, state, shutdown).await
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr()?;
    info!(addr = %local, "📈 Metrics server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Metrics server failed")?;

    info!("Metrics server stopped");
    Ok(())
}

// ── Handlers ────────────────────────────────────────────────────────

async fn landing() -> &'static str {
    concat!(
        "EC2 Monitor Exporter v",
        env!("CARGO_PKG_VERSION"),
        "\n\nMetrics: /metrics\nHealth:  /health\n"
    )
}

async fn metrics(State(state): State<AppState>) -> Response {
    let families = state.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {}", e)).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<Vec<HealthSnapshot>> {
    Json(state.pollers.iter().map(|p| p.health_snapshot()).collect())
}
