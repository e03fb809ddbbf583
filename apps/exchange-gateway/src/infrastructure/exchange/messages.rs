//! Exchange Wire Messages
//!
//! Serde types for the exchange's market data stream, trading WebSocket API
//! and REST error bodies, with conversions into domain types.
//!
//! # Market data
//!
//! ```json
//! {"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":101,"u":105,"pu":100,
//!  "b":[["50000.0","1.5"]],"a":[["50010.0","0"]]}
//! {"e":"markPriceUpdate","E":1700000000000,"s":"BTCUSDT","p":"50005.1"}
//! ```
//!
//! # Trading API
//!
//! ```json
//! {"id":"...","method":"order.place","params":{...}}
//! {"id":"...","status":200,"result":{...}}
//! {"id":"...","status":400,"error":{"code":-2010,"msg":"..."}}
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::order_book::{DiffEvent, OrderBookLevel};
use crate::domain::streaming::MarkPrice;

// =============================================================================
// Market Data
// =============================================================================

/// Order book diff event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdateMessage {
    /// Event type (`depthUpdate`).
    #[serde(rename = "e")]
    pub event_type: String,
    /// Event time in milliseconds.
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// First update id in the event.
    #[serde(rename = "U")]
    pub first_update_id: u64,
    /// Last update id in the event.
    #[serde(rename = "u")]
    pub last_update_id: u64,
    /// Last update id of the previous event.
    #[serde(rename = "pu")]
    pub prev_last_update_id: u64,
    /// Bid changes.
    #[serde(rename = "b", default)]
    pub bids: Vec<OrderBookLevel>,
    /// Ask changes.
    #[serde(rename = "a", default)]
    pub asks: Vec<OrderBookLevel>,
}

impl From<DepthUpdateMessage> for DiffEvent {
    fn from(msg: DepthUpdateMessage) -> Self {
        Self {
            first_update_id: msg.first_update_id,
            last_update_id: msg.last_update_id,
            prev_last_update_id: msg.prev_last_update_id,
            event_time: msg.event_time,
            bids: msg.bids,
            asks: msg.asks,
        }
    }
}

/// Mark price event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPriceMessage {
    /// Event type (`markPriceUpdate`).
    #[serde(rename = "e")]
    pub event_type: String,
    /// Event time in milliseconds.
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Mark price.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Index price.
    #[serde(
        rename = "i",
        default,
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub index_price: Option<Decimal>,
    /// Funding rate.
    #[serde(
        rename = "r",
        default,
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub funding_rate: Option<Decimal>,
    /// Next funding time in milliseconds.
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub next_funding_time: Option<i64>,
}

impl From<MarkPriceMessage> for MarkPrice {
    fn from(msg: MarkPriceMessage) -> Self {
        Self {
            symbol: msg.symbol,
            price: msg.price,
            event_time: msg.event_time,
        }
    }
}

/// Live stream subscription control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamControlRequest {
    /// `SUBSCRIBE` or `UNSUBSCRIBE`.
    pub method: String,
    /// Stream names.
    pub params: Vec<String>,
    /// Request id echoed in the acknowledgement.
    pub id: u64,
}

impl StreamControlRequest {
    /// Subscribe to `streams`.
    #[must_use]
    pub fn subscribe(streams: Vec<String>, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE".to_string(),
            params: streams,
            id,
        }
    }
}

/// Acknowledgement of a [`StreamControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamControlAck {
    /// Always `null` on success.
    pub result: Option<Value>,
    /// Echoed request id.
    pub id: u64,
}

/// Stream error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamErrorMessage {
    /// Error details.
    pub error: ExchangeErrorBody,
    /// Request id, when the error answers a request.
    #[serde(default)]
    pub id: Option<u64>,
}

/// Combined-stream wrapper: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Stream name.
    pub stream: String,
    /// Inner event.
    pub data: Value,
}

/// Stream name of a symbol's diff depth channel.
#[must_use]
pub fn depth_stream(symbol: &str, update_speed_ms: u64) -> String {
    let symbol = symbol.to_ascii_lowercase();
    if update_speed_ms == 250 {
        format!("{symbol}@depth")
    } else {
        format!("{symbol}@depth@{update_speed_ms}ms")
    }
}

/// Stream name of a symbol's one-second mark price channel.
#[must_use]
pub fn mark_price_stream(symbol: &str) -> String {
    format!("{}@markPrice@1s", symbol.to_ascii_lowercase())
}

// =============================================================================
// Trading API
// =============================================================================

/// Exchange error payload, shared by the WebSocket API and REST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeErrorBody {
    /// Exchange error code.
    pub code: i64,
    /// Human-readable message.
    pub msg: String,
}

/// Trading API request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequestFrame {
    /// Correlation id.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Signed parameters.
    pub params: Value,
}

/// Trading API response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponseFrame {
    /// Correlation id of the request. Absent on unsolicited frames.
    #[serde(default)]
    pub id: Option<String>,
    /// HTTP-like status code.
    #[serde(default)]
    pub status: u16,
    /// Result on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default)]
    pub error: Option<ExchangeErrorBody>,
}

// =============================================================================
// REST
// =============================================================================

/// Position entry returned by the position query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    /// Symbol.
    pub symbol: String,
    /// Signed position size.
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    /// Average entry price.
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    /// Current mark price.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub mark_price: Option<Decimal>,
    /// Unrealized profit.
    #[serde(default, rename = "unRealizedProfit", with = "rust_decimal::serde::str_option")]
    pub unrealized_profit: Option<Decimal>,
    /// Position side (`BOTH`, `LONG`, `SHORT`).
    #[serde(default)]
    pub position_side: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn depth_update_into_diff_event() {
        let json = r#"{"e":"depthUpdate","E":1700000000000,"T":1700000000000,"s":"BTCUSDT",
            "U":101,"u":105,"pu":100,"b":[["50000.0","1.5"]],"a":[["50010.0","0"]]}"#;
        let msg: DepthUpdateMessage = serde_json::from_str(json).unwrap();
        let event = DiffEvent::from(msg);

        assert_eq!(event.first_update_id, 101);
        assert_eq!(event.last_update_id, 105);
        assert_eq!(event.prev_last_update_id, 100);
        assert_eq!(event.bids, vec![OrderBookLevel::new("50000.0", "1.5")]);
        assert_eq!(event.asks, vec![OrderBookLevel::new("50010.0", "0")]);
    }

    #[test]
    fn mark_price_into_domain() {
        let json = r#"{"e":"markPriceUpdate","E":1700000000000,"s":"BTCUSDT","p":"50005.10",
            "i":"50001.0","P":"50003.0","r":"0.0001","T":1700028800000}"#;
        let msg: MarkPriceMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.funding_rate, Some(Decimal::from_str("0.0001").unwrap()));

        let price = MarkPrice::from(msg);
        assert_eq!(price.symbol, "BTCUSDT");
        assert_eq!(price.price, Decimal::from_str("50005.10").unwrap());
    }

    #[test]
    fn stream_names() {
        assert_eq!(depth_stream("BTCUSDT", 100), "btcusdt@depth@100ms");
        assert_eq!(depth_stream("BTCUSDT", 250), "btcusdt@depth");
        assert_eq!(mark_price_stream("ETHUSDT"), "ethusdt@markPrice@1s");
    }

    #[test]
    fn rpc_error_response() {
        let json = r#"{"id":"a1","status":400,"error":{"code":-2010,"msg":"insufficient balance"}}"#;
        let frame: RpcResponseFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.id.as_deref(), Some("a1"));
        assert_eq!(frame.status, 400);
        assert_eq!(frame.error.unwrap().code, -2010);
        assert!(frame.result.is_none());
    }

    #[test]
    fn position_info_parses() {
        let json = r#"{"symbol":"BTCUSDT","positionAmt":"-0.010","entryPrice":"50000.0",
            "markPrice":"49900.0","unRealizedProfit":"1.0","positionSide":"BOTH"}"#;
        let pos: PositionInfo = serde_json::from_str(json).unwrap();
        assert!(pos.position_amt.is_sign_negative());
        assert_eq!(pos.position_side.as_deref(), Some("BOTH"));
    }
}
