//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, feed status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks feeds)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::feed_state::{ConnectionState, FeedInfo, FeedState};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::server::ServerState;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed status.
    pub feeds: FeedsStatus,
    /// Downstream fan-out status.
    pub fanout: FanoutStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Upstream feed status.
#[derive(Debug, Clone, Serialize)]
pub struct FeedsStatus {
    /// Mark price rooms.
    pub mark_price: FeedInfo,
    /// Mark price feeds behind the price cache.
    pub price_cache: FeedInfo,
    /// Order book rooms.
    pub depth: FeedInfo,
    /// Trading RPC connection.
    pub trading: FeedInfo,
}

/// Downstream fan-out status.
#[derive(Debug, Clone, Serialize)]
pub struct FanoutStatus {
    /// Connected WebSocket clients.
    pub clients: usize,
    /// Live price rooms.
    pub price_rooms: usize,
    /// Live order book rooms.
    pub book_rooms: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Feed states observed by the health endpoint.
#[derive(Debug, Clone)]
pub struct FeedStates {
    /// Price hub.
    pub mark_price: Arc<FeedState>,
    /// Price cache.
    pub price_cache: Arc<FeedState>,
    /// Order book hub.
    pub depth: Arc<FeedState>,
    /// Trading RPC client.
    pub trading: Arc<FeedState>,
}

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feeds: FeedStates,
    server: Arc<ServerState>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, feeds: FeedStates, server: Arc<ServerState>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feeds,
            server,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);

    if response.status == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feeds = FeedsStatus {
        mark_price: state.feeds.mark_price.info(),
        price_cache: state.feeds.price_cache.info(),
        depth: state.feeds.depth.info(),
        trading: state.feeds.trading.info(),
    };

    HealthResponse {
        status: determine_health_status(&feeds),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feeds,
        fanout: FanoutStatus {
            clients: state.server.client_count(),
            price_rooms: state.server.price_rooms(),
            book_rooms: state.server.book_rooms(),
        },
    }
}

/// Market feeds only connect while rooms exist, so an idle market feed is
/// fine; one stuck in backoff is not. The trading channel should always be
/// connected, though REST keeps trading available without it.
fn determine_health_status(feeds: &FeedsStatus) -> HealthStatus {
    let market = [&feeds.mark_price, &feeds.price_cache, &feeds.depth];
    let market_impaired = market
        .iter()
        .filter(|info| info.state == ConnectionState::Reconnecting)
        .count();
    let trading_impaired = !feeds.trading.connected;

    match (market_impaired, trading_impaired) {
        (0, false) => HealthStatus::Healthy,
        (n, true) if n == market.len() => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
