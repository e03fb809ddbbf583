//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedSource`: Upstream market data feed for one room
//! - `SnapshotSource`: REST order book snapshot provider
//! - `TradeChannel`: Transport that executes trade commands
//!
//! ## Driver Ports (Inbound)
//!
//! - `FeedSink`: Where a running feed delivers its payloads

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::order_book::{DepthSnapshot, SyncError};
use crate::domain::subscription::RoomKey;
use crate::domain::trading::TradeCommand;

// =============================================================================
// Feeds
// =============================================================================

/// Failure of one feed session. Always transient from the hub's point of view.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Connection to the exchange failed or dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// The order book lost continuity.
    #[error("order book desync: {0}")]
    Desync(#[from] SyncError),

    /// Snapshot could not be fetched or never bridged.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// The exchange answered with an error frame.
    #[error("exchange error {code}: {msg}")]
    Exchange {
        /// Exchange error code.
        code: i64,
        /// Exchange message.
        msg: String,
    },

    /// The key is not valid for this feed.
    #[error("unsupported room key {0}")]
    UnsupportedKey(String),
}

/// Receives payloads from a running feed.
pub trait FeedSink<P>: Send + Sync {
    /// Deliver one payload. Must not block.
    fn publish(&self, payload: P);

    /// Report that the upstream connection is established.
    fn connected(&self);
}

/// An upstream feed that can be run for a room.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// Payload fanned out to subscribers.
    type Payload: Clone + Send + Sync + 'static;

    /// Feed name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Run one session for `key` until it fails or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session. Returns `Ok(())` only when
    /// cancelled.
    async fn run(
        &self,
        key: &RoomKey,
        sink: Arc<dyn FeedSink<Self::Payload>>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError>;
}

/// Source of order book snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetch a snapshot with at least `levels` levels per side.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Snapshot`] on any failure.
    async fn fetch_snapshot(&self, symbol: &str, levels: usize)
    -> Result<DepthSnapshot, FeedError>;
}

// =============================================================================
// Trade Execution
// =============================================================================

/// A transport that executes trade commands.
#[async_trait]
pub trait TradeChannel: Send + Sync {
    /// Channel error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Channel name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Execute one command and return the exchange's result payload.
    ///
    /// # Errors
    ///
    /// Returns the channel's error on transport, timeout or exchange failure.
    async fn execute(&self, command: &TradeCommand) -> Result<Value, Self::Error>;
}

/// A channel that can be asked to re-establish its connection.
pub trait Reconnectable: TradeChannel {
    /// Whether `error` means the connection itself is unusable. Rejections
    /// and per-request timeouts leave a healthy connection alone.
    fn is_connection_failure(&self, error: &Self::Error) -> bool;

    /// Request a reconnect without waiting for it.
    fn trigger_reconnect(&self);
}
