//! Market Stream Codec
//!
//! Classifies text frames from the market data stream. Frames arrive either
//! raw or wrapped in a combined-stream envelope; both decode to the same
//! [`MarketMessage`].

use serde_json::Value;

use super::messages::{
    DepthUpdateMessage, MarkPriceMessage, StreamControlAck, StreamEnvelope, StreamErrorMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is not a JSON object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// A decoded market data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketMessage {
    /// Order book diff.
    Depth(DepthUpdateMessage),
    /// Mark price update.
    MarkPrice(MarkPriceMessage),
    /// Subscription acknowledgement.
    Ack(StreamControlAck),
    /// Error frame.
    Error(StreamErrorMessage),
    /// Event type this gateway does not consume.
    Other(String),
}

/// Decode one market data text frame.
///
/// # Errors
///
/// Returns an error when the frame is not JSON or a known event is malformed.
pub fn decode_market(text: &str) -> Result<MarketMessage, CodecError> {
    let value: Value = serde_json::from_str(text.trim())?;
    if !value.is_object() {
        let preview: String = text.chars().take(50).collect();
        return Err(CodecError::InvalidFormat(format!(
            "expected JSON object, got: {preview}..."
        )));
    }

    let value = if value.get("stream").is_some() && value.get("data").is_some() {
        serde_json::from_value::<StreamEnvelope>(value)?.data
    } else {
        value
    };

    match value.get("e").and_then(Value::as_str) {
        Some("depthUpdate") => Ok(MarketMessage::Depth(serde_json::from_value(value)?)),
        Some("markPriceUpdate") => Ok(MarketMessage::MarkPrice(serde_json::from_value(value)?)),
        Some(other) => Ok(MarketMessage::Other(other.to_string())),
        None if value.get("error").is_some() => {
            Ok(MarketMessage::Error(serde_json::from_value(value)?))
        }
        None if value.get("id").is_some() => Ok(MarketMessage::Ack(serde_json::from_value(value)?)),
        None => Ok(MarketMessage::Other(String::new())),
    }
}
