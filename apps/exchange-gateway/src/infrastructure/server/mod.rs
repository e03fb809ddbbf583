//! Downstream WebSocket Server
//!
//! Serves internal consumers over two endpoints:
//!
//! - `GET /ws/price` streams mark prices for the symbols a client subscribes to.
//! - `GET /ws/orderbook?levels=N` streams order books truncated to `N` levels
//!   (default 20).
//!
//! Connections must present the shared token as `?token=`, an `X-Auth-Token`
//! header or `Authorization: Bearer`. The token is checked before the upgrade;
//! a missing or wrong token gets `401`.
//!
//! After the upgrade clients send `{"action":"subscribe","symbol":"BTCUSDT"}`,
//! `unsubscribe` or `ping` and receive payloads plus `subscribed`,
//! `unsubscribed`, `pong` and `error` notices.

mod client;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use client::ClientConfig;

use crate::domain::streaming::{BookUpdate, MarkPrice};
use crate::domain::subscription::{DEFAULT_BOOK_LEVELS, MAX_BOOK_LEVELS};
use crate::infrastructure::config::AuthToken;
use crate::infrastructure::hub::RoomRegistry;

/// Header carrying the connection token.
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

// =============================================================================
// State
// =============================================================================

/// Shared state of the downstream server.
pub struct ServerState {
    prices: Arc<dyn RoomRegistry<MarkPrice>>,
    books: Arc<dyn RoomRegistry<Arc<BookUpdate>>>,
    client: ClientConfig,
    auth_token: AuthToken,
    next_client_id: AtomicU64,
    connected: AtomicUsize,
    cancel: CancellationToken,
}

impl ServerState {
    /// Create server state. Client connections stop when `cancel` fires.
    #[must_use]
    pub fn new(
        prices: Arc<dyn RoomRegistry<MarkPrice>>,
        books: Arc<dyn RoomRegistry<Arc<BookUpdate>>>,
        client: ClientConfig,
        auth_token: AuthToken,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            prices,
            books,
            client,
            auth_token,
            next_client_id: AtomicU64::new(1),
            connected: AtomicUsize::new(0),
            cancel: cancel.child_token(),
        }
    }

    /// Live price rooms.
    #[must_use]
    pub fn price_rooms(&self) -> usize {
        self.prices.room_count()
    }

    /// Live order book rooms.
    #[must_use]
    pub fn book_rooms(&self) -> usize {
        self.books.room_count()
    }

    /// Connected downstream clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    fn authorized(&self, query_token: Option<&str>, headers: &HeaderMap) -> bool {
        presented_token(query_token, headers).is_some_and(|token| self.auth_token.matches(token))
    }
}

/// Token from the query string, the token header or a bearer credential.
fn presented_token<'a>(query_token: Option<&'a str>, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token);
    }
    if let Some(token) = headers.get(AUTH_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(token);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

// =============================================================================
// Server
// =============================================================================

/// Downstream WebSocket server.
pub struct GatewayServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Create a server bound to `addr` once run.
    #[must_use]
    pub const fn new(addr: SocketAddr, state: Arc<ServerState>, cancel: CancellationToken) -> Self {
        Self { addr, state, cancel }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the server stops with an
    /// error.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.addr, e.to_string()))?;
        serve(listener, self.state, self.cancel).await
    }
}

/// Serve on an already bound listener until cancelled.
///
/// # Errors
///
/// Returns [`ServerError::ServerFailed`] if the server stops with an error.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let local = listener.local_addr().ok();
    tracing::info!(addr = ?local, "Gateway server listening");

    let clients = state.cancel.clone();
    let shutdown = async move {
        cancel.cancelled().await;
        clients.cancel();
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

    tracing::info!("Gateway server stopped");
    Ok(())
}

/// Routes of the downstream server.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws/price", get(price_handler))
        .route("/ws/orderbook", get(orderbook_handler))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    levels: Option<usize>,
}

async fn price_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(params.token.as_deref(), &headers) {
        return unauthorized();
    }

    let rooms = Arc::clone(&state.prices);
    upgrade(ws, state, rooms, None)
}

async fn orderbook_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(params.token.as_deref(), &headers) {
        return unauthorized();
    }

    let levels = params.levels.unwrap_or(DEFAULT_BOOK_LEVELS);
    if levels == 0 || levels > MAX_BOOK_LEVELS {
        return (
            StatusCode::BAD_REQUEST,
            format!("levels must be between 1 and {MAX_BOOK_LEVELS}"),
        )
            .into_response();
    }

    let rooms = Arc::clone(&state.books);
    upgrade(ws, state, rooms, Some(levels))
}

fn upgrade<P>(
    ws: WebSocketUpgrade,
    state: Arc<ServerState>,
    rooms: Arc<dyn RoomRegistry<P>>,
    levels: Option<usize>,
) -> Response
where
    P: Serialize + Send + 'static,
{
    let client = state.next_client_id();
    let config = state.client.clone();
    let cancel = state.cancel.child_token();

    ws.on_upgrade(move |socket| async move {
        state.connected.fetch_add(1, Ordering::Relaxed);
        client::serve_client(socket, rooms, levels, client, config, cancel).await;
        state.connected.fetch_sub(1, Ordering::Relaxed);
    })
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "missing or invalid token").into_response()
}

// =============================================================================
// Errors
// =============================================================================

/// Downstream server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn query_token_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_TOKEN_HEADER, HeaderValue::from_static("header"));
        assert_eq!(presented_token(Some("query"), &headers), Some("query"));
        assert_eq!(presented_token(Some(""), &headers), Some("header"));
    }

    #[test]
    fn bearer_token_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(presented_token(None, &headers), Some("secret"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic secret"));
        assert_eq!(presented_token(None, &headers), None);
    }
}
