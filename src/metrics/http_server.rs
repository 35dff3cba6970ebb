//! HTTP server for health, stats and metrics endpoints.
//!
//! Provides:
//! - `/metrics` - Prometheus metrics
//! - `/health` - Liveness
//! - `/stats` - Counters, queue occupancy and open sessions as JSON
//! - `/sessions` - Open sessions only

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::prometheus_export::PrometheusMetrics;
use super::StatusResponse;

/// Source of the status document.
pub trait StatusProvider: Send + Sync {
    fn status(&self) -> StatusResponse;
}

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpServerState {
    pub metrics: Arc<PrometheusMetrics>,
    pub status_provider: Arc<dyn StatusProvider>,
    pub start_time: Instant,
}

/// HTTP status server.
pub struct MetricsHttpServer {
    bind_addr: SocketAddr,
    state: HttpServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl MetricsHttpServer {
    pub fn new(
        bind_addr: SocketAddr,
        metrics: Arc<PrometheusMetrics>,
        status_provider: Arc<dyn StatusProvider>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            state: HttpServerState {
                metrics,
                status_provider,
                start_time: Instant::now(),
            },
            shutdown_tx,
        }
    }

    /// Serve until [`stop`](Self::stop) is called.
    pub async fn start(&self) -> Result<(), std::io::Error> {
        let app = self.build_router();

        info!("Starting metrics HTTP server on {}", self.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    }

    fn build_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/sessions", get(sessions_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "gnss-relay",
        "version": crate::VERSION,
        "endpoints": ["/health", "/stats", "/sessions", "/metrics"]
    }))
}

async fn health_handler(State(state): State<HttpServerState>) -> impl IntoResponse {
    let status = state.status_provider.status();
    if status.queue.accepting {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DRAINING")
    }
}

async fn stats_handler(State(state): State<HttpServerState>) -> impl IntoResponse {
    let mut status = state.status_provider.status();
    status.uptime_seconds = state.start_time.elapsed().as_secs();
    Json(status)
}

async fn sessions_handler(State(state): State<HttpServerState>) -> impl IntoResponse {
    Json(state.status_provider.status().sessions)
}

async fn metrics_handler(State(state): State<HttpServerState>) -> impl IntoResponse {
    let status = state.status_provider.status();
    state
        .metrics
        .update(&status.counters, &status.queue, status.sessions.len());

    match state.metrics.encode() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            metrics,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}"),
        ),
    }
}
