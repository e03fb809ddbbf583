//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Upstream**: Messages received per feed, reconnects, order book resyncs
//! - **Fan-out**: Rooms, downstream clients, frames sent and dropped
//! - **Execution**: RPC requests by outcome, pending requests, latency
//! - **Price cache**: Lookups by result
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "gateway_upstream_messages_total",
        "Messages received from exchange feeds"
    );
    describe_counter!(
        "gateway_reconnects_total",
        "Upstream reconnection attempts"
    );
    describe_counter!(
        "gateway_orderbook_resyncs_total",
        "Order book resynchronizations by reason"
    );

    describe_gauge!("gateway_rooms", "Active fan-out rooms");
    describe_gauge!("gateway_clients", "Connected downstream clients");
    describe_counter!(
        "gateway_frames_sent_total",
        "Payloads queued to downstream clients"
    );
    describe_counter!(
        "gateway_frames_dropped_total",
        "Payloads dropped because a client mailbox was full"
    );

    describe_counter!(
        "gateway_rpc_requests_total",
        "Trading RPC requests by method and outcome"
    );
    describe_gauge!(
        "gateway_rpc_pending",
        "Trading RPC requests awaiting a response"
    );
    describe_histogram!(
        "gateway_rpc_latency_seconds",
        "Trading RPC round-trip latency"
    );
    describe_counter!(
        "gateway_trade_fallbacks_total",
        "Trade commands executed over REST after an RPC failure"
    );

    describe_counter!(
        "gateway_price_cache_lookups_total",
        "Price cache lookups by result"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for upstream feeds.
#[derive(Debug, Clone, Copy)]
pub enum FeedKind {
    /// Mark price stream.
    MarkPrice,
    /// Order book depth stream.
    Depth,
    /// Trading RPC connection.
    Trading,
}

impl FeedKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarkPrice => "mark_price",
            Self::Depth => "depth",
            Self::Trading => "trading",
        }
    }

    /// Resolve a feed name as returned by `FeedSource::name`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "depth" => Self::Depth,
            "trading" => Self::Trading,
            _ => Self::MarkPrice,
        }
    }
}

/// Outcome label for RPC requests.
#[derive(Debug, Clone, Copy)]
pub enum RpcOutcome {
    /// Successful response.
    Ok,
    /// Exchange returned an error.
    Rejected,
    /// No response in time.
    Timeout,
    /// Connection closed while pending.
    Closed,
    /// Not sent.
    Unsent,
}

impl RpcOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Closed => "closed",
            Self::Unsent => "unsent",
        }
    }
}

/// Record a message received from an exchange feed.
pub fn record_upstream_message(feed: FeedKind) {
    counter!("gateway_upstream_messages_total", "feed" => feed.as_str()).increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect(feed: FeedKind) {
    counter!("gateway_reconnects_total", "feed" => feed.as_str()).increment(1);
}

/// Record an order book resync.
pub fn record_resync(reason: &'static str) {
    counter!("gateway_orderbook_resyncs_total", "reason" => reason).increment(1);
}

/// Update the active room count for a feed.
#[allow(clippy::cast_precision_loss)]
pub fn set_rooms(feed: FeedKind, count: usize) {
    gauge!("gateway_rooms", "feed" => feed.as_str()).set(count as f64);
}

/// Track downstream client connects and disconnects.
pub fn client_connected() {
    gauge!("gateway_clients").increment(1.0);
}

/// See [`client_connected`].
pub fn client_disconnected() {
    gauge!("gateway_clients").decrement(1.0);
}

/// Record payloads queued to downstream clients.
pub fn record_frames_sent(feed: FeedKind, count: u64) {
    counter!("gateway_frames_sent_total", "feed" => feed.as_str()).increment(count);
}

/// Record payloads dropped for slow clients.
pub fn record_frames_dropped(feed: FeedKind, count: u64) {
    counter!("gateway_frames_dropped_total", "feed" => feed.as_str()).increment(count);
}

/// Record an RPC request outcome and its latency.
pub fn record_rpc_request(method: &'static str, outcome: RpcOutcome, latency: Duration) {
    counter!(
        "gateway_rpc_requests_total",
        "method" => method,
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!("gateway_rpc_latency_seconds", "method" => method).record(latency.as_secs_f64());
}

/// Update the pending RPC request count.
#[allow(clippy::cast_precision_loss)]
pub fn set_rpc_pending(count: usize) {
    gauge!("gateway_rpc_pending").set(count as f64);
}

/// Record a command executed over the fallback channel.
pub fn record_trade_fallback(command: &'static str) {
    counter!("gateway_trade_fallbacks_total", "command" => command).increment(1);
}

/// Record a price cache lookup (`hit`, `filled` or `timeout`).
pub fn record_price_lookup(result: &'static str) {
    counter!("gateway_price_cache_lookups_total", "result" => result).increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_kind_labels() {
        assert_eq!(FeedKind::MarkPrice.as_str(), "mark_price");
        assert_eq!(FeedKind::Depth.as_str(), "depth");
        assert_eq!(FeedKind::from_name("depth").as_str(), "depth");
        assert_eq!(FeedKind::from_name("trading").as_str(), "trading");
    }

    #[test]
    fn rpc_outcome_labels() {
        assert_eq!(RpcOutcome::Ok.as_str(), "ok");
        assert_eq!(RpcOutcome::Timeout.as_str(), "timeout");
        assert_eq!(RpcOutcome::Closed.as_str(), "closed");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_upstream_message(FeedKind::Depth);
        record_rpc_request("order.place", RpcOutcome::Ok, Duration::from_millis(5));
        set_rooms(FeedKind::MarkPrice, 3);
    }
}
