//! Market Stream Sessions
//!
//! Opens a market data connection and subscribes it to a set of streams.

use tokio_util::sync::CancellationToken;

use super::connection::{Connection, ConnectionConfig, TransportError};
use super::messages::StreamControlRequest;
use crate::application::ports::FeedError;

/// Request id of the initial `SUBSCRIBE`.
pub const SUBSCRIBE_REQUEST_ID: u64 = 1;

impl From<TransportError> for FeedError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Connect and queue a subscription to `streams`.
///
/// # Errors
///
/// Returns [`FeedError::Transport`] if the connection cannot be opened or
/// the request cannot be queued.
pub async fn open_market_stream(
    config: &ConnectionConfig,
    streams: Vec<String>,
    cancel: &CancellationToken,
) -> Result<Connection, FeedError> {
    let connection = Connection::connect(config, cancel).await?;

    let request = StreamControlRequest::subscribe(streams, SUBSCRIBE_REQUEST_ID);
    let text = serde_json::to_string(&request)
        .map_err(|e| FeedError::Transport(format!("encode subscribe: {e}")))?;
    connection.writer().send_text(text)?;

    tracing::debug!(url = %config.url, streams = ?request.params, "Subscribed to market streams");
    Ok(connection)
}
