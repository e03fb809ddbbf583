//! Execution RPC Client
//!
//! Multiplexes signed trade requests over one persistent trading WebSocket.
//!
//! # Correlation
//!
//! Every request gets a fresh UUID and a single-use channel registered under
//! it. One reader task per connection routes responses by id. A pending entry
//! is removed exactly once:
//!
//! - by the reader, when the matching response arrives;
//! - by the caller's guard, on timeout or cancellation;
//! - by the reader, when the connection ends (every entry fails with
//!   [`RpcError::ConnectionClosed`]).
//!
//! # Reconnection
//!
//! Callers treat every error as non-fatal and fall back to REST. They call
//! [`ExecutionRpcClient::trigger_reconnect`], which reconnects in the
//! background. Concurrent triggers collapse into one reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::{AuthError, Params, Signer};
use super::commands::command_params;
use super::connection::{Connection, ConnectionConfig, ConnectionWriter, TransportError};
use super::messages::{RpcRequestFrame, RpcResponseFrame};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{Reconnectable, TradeChannel};
use crate::domain::trading::TradeCommand;
use crate::infrastructure::feed_state::FeedState;
use crate::infrastructure::metrics::{self, FeedKind, RpcOutcome};

// =============================================================================
// Error Type
// =============================================================================

/// RPC failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The exchange rejected the request.
    #[error("exchange error {code}: {msg}")]
    Exchange {
        /// Exchange error code.
        code: i64,
        /// Exchange message.
        msg: String,
    },

    /// No response within the deadline. The request may still execute.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The connection ended while the request was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// No connection has been established.
    #[error("not connected")]
    NotConnected,

    /// The request could not be written.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request could not be signed.
    #[error("signing failed: {0}")]
    Signing(#[from] AuthError),
}

impl RpcError {
    /// Whether the request definitely did not execute.
    #[must_use]
    pub const fn is_unsent(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(_) | Self::Signing(_))
    }

    /// Whether the connection itself failed, as opposed to this one request.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::NotConnected | Self::Transport(_))
    }

    const fn outcome(&self) -> RpcOutcome {
        match self {
            Self::Exchange { .. } => RpcOutcome::Rejected,
            Self::Timeout(_) => RpcOutcome::Timeout,
            Self::ConnectionClosed => RpcOutcome::Closed,
            Self::NotConnected | Self::Transport(_) | Self::Signing(_) => RpcOutcome::Unsent,
        }
    }
}

// =============================================================================
// Methods
// =============================================================================

/// Trading API methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    /// Authenticate the session.
    Logon,
    /// Place an order.
    OrderPlace,
    /// Modify an order.
    OrderModify,
    /// Cancel an order.
    OrderCancel,
    /// Query an order.
    OrderStatus,
    /// Place an algorithmic order.
    AlgoOrderPlace,
    /// Cancel an algorithmic order.
    AlgoOrderCancel,
    /// Query positions.
    AccountPosition,
    /// Change leverage.
    AccountLeverage,
}

impl RpcMethod {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Logon => "session.logon",
            Self::OrderPlace => "order.place",
            Self::OrderModify => "order.modify",
            Self::OrderCancel => "order.cancel",
            Self::OrderStatus => "order.status",
            Self::AlgoOrderPlace => "algoOrder.place",
            Self::AlgoOrderCancel => "algoOrder.cancel",
            Self::AccountPosition => "account.position",
            Self::AccountLeverage => "account.leverage",
        }
    }

    /// Method that executes `command`.
    #[must_use]
    pub const fn for_command(command: &TradeCommand) -> Self {
        match command {
            TradeCommand::PlaceOrder(_) => Self::OrderPlace,
            TradeCommand::ModifyOrder(_) => Self::OrderModify,
            TradeCommand::CancelOrder { .. } => Self::OrderCancel,
            TradeCommand::OrderStatus { .. } => Self::OrderStatus,
            TradeCommand::PlaceAlgoOrder(_) => Self::AlgoOrderPlace,
            TradeCommand::CancelAlgoOrder { .. } => Self::AlgoOrderCancel,
            TradeCommand::QueryPosition { .. } => Self::AccountPosition,
            TradeCommand::SetLeverage { .. } => Self::AccountLeverage,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// RPC client configuration.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Trading WebSocket connection.
    pub connection: ConnectionConfig,
    /// Default deadline of [`TradeChannel::execute`].
    pub request_timeout: Duration,
    /// Backoff between background reconnect attempts.
    pub reconnect: ReconnectConfig,
}

// =============================================================================
// Session
// =============================================================================

type Reply = Result<Value, RpcError>;

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Reply>>,
}

/// One live connection and its in-flight requests.
struct Session {
    writer: ConnectionWriter,
    pending: Mutex<PendingTable>,
    cancel: CancellationToken,
}

impl Session {
    fn register(self: &Arc<Self>, id: &str, tx: oneshot::Sender<Reply>) -> Result<PendingGuard, RpcError> {
        let mut table = self.pending.lock();
        if table.closed {
            return Err(RpcError::ConnectionClosed);
        }
        table.waiters.insert(id.to_string(), tx);
        metrics::set_rpc_pending(table.waiters.len());
        Ok(PendingGuard {
            session: Arc::clone(self),
            id: id.to_string(),
        })
    }

    fn resolve(&self, id: &str, reply: Reply) -> bool {
        let waiter = {
            let mut table = self.pending.lock();
            let waiter = table.waiters.remove(id);
            metrics::set_rpc_pending(table.waiters.len());
            waiter
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request and refuse new ones.
    fn close(&self) -> usize {
        let waiters = {
            let mut table = self.pending.lock();
            table.closed = true;
            std::mem::take(&mut table.waiters)
        };
        metrics::set_rpc_pending(0);
        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
        self.cancel.cancel();
        count
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }
}

/// Deregisters a pending request when the caller stops waiting.
struct PendingGuard {
    session: Arc<Session>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut table = self.session.pending.lock();
        if table.waiters.remove(&self.id).is_some() {
            metrics::set_rpc_pending(table.waiters.len());
        }
    }
}

// =============================================================================
// Client
// =============================================================================

struct Inner {
    config: RpcClientConfig,
    signer: Signer,
    session: RwLock<Option<Arc<Session>>>,
    state: Arc<FeedState>,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
}

/// Trading WebSocket client. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionRpcClient {
    inner: Arc<Inner>,
}

impl ExecutionRpcClient {
    /// Create a disconnected client. Everything stops when `cancel` fires.
    #[must_use]
    pub fn new(config: RpcClientConfig, signer: Signer, cancel: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                signer,
                session: RwLock::new(None),
                state: Arc::new(FeedState::new(FeedKind::Trading.as_str())),
                reconnecting: AtomicBool::new(false),
                cancel: cancel.child_token(),
            }),
        }
    }

    /// Connection state shared with the health endpoint.
    #[must_use]
    pub fn feed_state(&self) -> Arc<FeedState> {
        Arc::clone(&self.inner.state)
    }

    /// Whether a live session exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner
            .session
            .read()
            .as_ref()
            .is_some_and(|session| !session.is_closed())
    }

    /// Open a connection, replacing any previous one, and log on.
    ///
    /// A failed logon is logged but does not fail the connect.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] if the connection cannot be opened.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let state = &self.inner.state;
        state.connecting();

        let connection = match Connection::connect(&self.inner.config.connection, &self.inner.cancel).await {
            Ok(connection) => connection,
            Err(e) => {
                state.session_ended(false, Some(e.to_string()));
                return Err(RpcError::Transport(e.to_string()));
            }
        };

        let session = Arc::new(Session {
            writer: connection.writer(),
            pending: Mutex::new(PendingTable::default()),
            cancel: connection.cancel_token(),
        });
        let previous = self.inner.session.write().replace(Arc::clone(&session));
        if let Some(previous) = previous {
            previous.close();
        }

        state.connected();
        tokio::spawn(read_loop(connection, session, Arc::clone(state)));
        tracing::info!(url = %self.inner.config.connection.url, "Trading connection established");

        if let Err(e) = self
            .send(RpcMethod::Logon, Params::new(), self.inner.config.request_timeout)
            .await
        {
            tracing::warn!(error = %e, "Session logon failed");
        }
        Ok(())
    }

    /// Send a signed request and wait for its response.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Exchange`] when the exchange rejects the request.
    /// - [`RpcError::Timeout`] when no response arrives within `timeout`.
    /// - [`RpcError::ConnectionClosed`] when the connection ends first.
    /// - [`RpcError::NotConnected`], [`RpcError::Transport`] or
    ///   [`RpcError::Signing`] when the request was never sent.
    pub async fn send(&self, method: RpcMethod, params: Params, timeout: Duration) -> Result<Value, RpcError> {
        let started = Instant::now();
        let result = self.send_inner(method, params, timeout).await;

        let outcome = result.as_ref().map_or_else(RpcError::outcome, |_| RpcOutcome::Ok);
        metrics::record_rpc_request(method.as_str(), outcome, started.elapsed());
        result
    }

    async fn send_inner(&self, method: RpcMethod, params: Params, timeout: Duration) -> Result<Value, RpcError> {
        let session = self
            .inner
            .session
            .read()
            .clone()
            .ok_or(RpcError::NotConnected)?;

        let params = self
            .inner
            .signer
            .sign_params(params, Utc::now().timestamp_millis())?;
        let id = Uuid::new_v4().to_string();
        let frame = RpcRequestFrame {
            id: id.clone(),
            method: method.as_str().to_string(),
            params: params.to_json(),
        };
        let text = serde_json::to_string(&frame).map_err(|e| RpcError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let _guard = session.register(&id, tx)?;
        session.writer.send_text(text).map_err(|e| match e {
            TransportError::Closed => RpcError::ConnectionClosed,
            other => RpcError::Transport(other.to_string()),
        })?;
        tracing::debug!(request_id = %id, method = method.as_str(), "RPC request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(request_id = %id, method = method.as_str(), ?timeout, "RPC request timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Reconnect in the background. Returns immediately; a reconnect already
    /// in progress absorbs this call, and a live session is left in place.
    pub fn trigger_reconnect(&self) {
        if self.inner.cancel.is_cancelled() || self.is_connected() {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            client.reconnect_loop().await;
            client.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        let mut policy = ReconnectPolicy::new(self.inner.config.reconnect.clone());
        loop {
            if self.is_connected() {
                return;
            }
            match self.connect().await {
                Ok(()) => return,
                Err(e) => tracing::warn!(error = %e, "Trading reconnect failed"),
            }

            let Some(delay) = policy.next_delay() else {
                tracing::error!("Giving up on trading reconnect");
                return;
            };
            let attempt = policy.attempt_count();
            self.inner.state.reconnecting(attempt);
            metrics::record_reconnect(FeedKind::Trading);
            tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting trading connection");

            tokio::select! {
                () = self.inner.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Close the connection and fail every pending request.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(session) = self.inner.session.write().take() {
            let failed = session.close();
            tracing::info!(failed, "Trading client shut down");
        }
    }
}

async fn read_loop(mut connection: Connection, session: Arc<Session>, state: Arc<FeedState>) {
    let reason = loop {
        match connection.recv().await {
            Ok(text) => {
                state.record_message();
                dispatch(&session, &text);
            }
            Err(e) => break e,
        }
    };

    let failed = session.close();
    let error = match reason {
        TransportError::Cancelled => None,
        other => Some(other.to_string()),
    };
    tracing::info!(failed, error = ?error, "Trading connection closed");
    state.session_ended(true, error);
}

fn dispatch(session: &Session, text: &str) {
    let frame: RpcResponseFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable trading frame");
            return;
        }
    };
    let Some(id) = frame.id else {
        tracing::debug!("Ignoring uncorrelated trading frame");
        return;
    };

    let reply = match (frame.error, frame.result) {
        (Some(error), _) => Err(RpcError::Exchange {
            code: error.code,
            msg: error.msg,
        }),
        (None, Some(result)) => Ok(result),
        (None, None) => Ok(Value::Null),
    };
    if !session.resolve(&id, reply) {
        tracing::debug!(request_id = %id, "Response for unknown or expired request");
    }
}

#[async_trait]
impl TradeChannel for ExecutionRpcClient {
    type Error = RpcError;

    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn execute(&self, command: &TradeCommand) -> Result<Value, RpcError> {
        self.send(
            RpcMethod::for_command(command),
            command_params(command),
            self.inner.config.request_timeout,
        )
        .await
    }
}

impl Reconnectable for ExecutionRpcClient {
    fn is_connection_failure(&self, error: &RpcError) -> bool {
        error.is_connection_failure()
    }

    fn trigger_reconnect(&self) {
        Self::trigger_reconnect(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names() {
        assert_eq!(RpcMethod::Logon.as_str(), "session.logon");
        assert_eq!(
            RpcMethod::for_command(&TradeCommand::CancelAlgoOrder { algo_id: 1 }).as_str(),
            "algoOrder.cancel"
        );
        assert_eq!(
            RpcMethod::for_command(&TradeCommand::SetLeverage {
                symbol: "BTCUSDT".to_string(),
                leverage: 5
            }),
            RpcMethod::AccountLeverage
        );
    }

    #[test]
    fn unsent_errors_are_retry_safe() {
        assert!(RpcError::NotConnected.is_unsent());
        assert!(!RpcError::Timeout(Duration::from_secs(1)).is_unsent());
        assert!(!RpcError::ConnectionClosed.is_unsent());
    }

    #[test]
    fn only_connection_errors_call_for_reconnect() {
        assert!(RpcError::ConnectionClosed.is_connection_failure());
        assert!(RpcError::NotConnected.is_connection_failure());
        assert!(RpcError::Transport("reset".to_string()).is_connection_failure());
        assert!(!RpcError::Timeout(Duration::from_secs(1)).is_connection_failure());
        assert!(
            !RpcError::Exchange {
                code: -2010,
                msg: "insufficient balance".to_string()
            }
            .is_connection_failure()
        );
    }

    fn session() -> (Arc<Session>, tokio::sync::mpsc::Receiver<tokio_tungstenite::tungstenite::Message>) {
        let (writer, rx) = ConnectionWriter::detached(4);
        let session = Arc::new(Session {
            writer,
            pending: Mutex::new(PendingTable::default()),
            cancel: CancellationToken::new(),
        });
        (session, rx)
    }

    #[test]
    fn dispatch_routes_by_id_once() {
        let (session, _rx) = session();
        let (tx, mut rx) = oneshot::channel();
        let guard = session.register("a", tx).unwrap();

        dispatch(&session, r#"{"id":"a","status":200,"result":{"orderId":1}}"#);
        dispatch(&session, r#"{"id":"a","status":200,"result":{"orderId":2}}"#);

        assert_eq!(rx.try_recv().unwrap().unwrap()["orderId"], 1);
        drop(guard);
        assert!(session.pending.lock().waiters.is_empty());
    }

    #[test]
    fn dispatch_maps_exchange_errors() {
        let (session, _rx) = session();
        let (tx, mut rx) = oneshot::channel();
        let _guard = session.register("b", tx).unwrap();

        dispatch(&session, r#"{"id":"b","status":400,"error":{"code":-2010,"msg":"rejected"}}"#);

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RpcError::Exchange {
                code: -2010,
                msg: "rejected".to_string()
            })
        );
    }

    #[test]
    fn close_fails_pending_and_refuses_new() {
        let (session, _rx) = session();
        let (tx, mut rx) = oneshot::channel();
        let _guard = session.register("c", tx).unwrap();

        assert_eq!(session.close(), 1);
        assert_eq!(rx.try_recv().unwrap(), Err(RpcError::ConnectionClosed));
        assert!(matches!(
            session.register("d", oneshot::channel().0),
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[test]
    fn guard_removes_entry_on_drop() {
        let (session, _rx) = session();
        let guard = session.register("e", oneshot::channel().0).unwrap();
        assert_eq!(session.pending.lock().waiters.len(), 1);
        drop(guard);
        assert!(session.pending.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn send_without_connection_is_unsent() {
        let config = RpcClientConfig {
            connection: ConnectionConfig::new("ws://127.0.0.1:1"),
            request_timeout: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
        };
        let signer = Signer::new(crate::infrastructure::config::Credentials::new(
            "k".to_string(),
            "s".to_string(),
        ));
        let client = ExecutionRpcClient::new(config, signer, &CancellationToken::new());

        let err = client
            .send(RpcMethod::OrderStatus, Params::new(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NotConnected);
        assert!(!client.is_connected());
    }
}
