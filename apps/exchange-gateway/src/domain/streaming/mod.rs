//! Market Data Streaming Types
//!
//! Payloads fanned out to downstream consumers: mark prices and order book
//! views. These are the canonical internal representation; their serde form
//! is the downstream wire format.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::order_book::{BookSide, LocalOrderBook, OrderBookLevel};

/// Latest mark price of a symbol. Serialized as `{"s", "p", "t"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPrice {
    /// Exchange symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Mark price.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Exchange event time in milliseconds.
    #[serde(rename = "t")]
    pub event_time: i64,
}

/// Top-of-book view. Serialized as `{"type": "book", "s", "t", "b", "a"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "book")]
pub struct BookUpdate {
    /// Exchange symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Event time of the last applied diff, in milliseconds.
    #[serde(rename = "t")]
    pub event_time: i64,
    /// Best bids, highest first.
    #[serde(rename = "b")]
    pub bids: Vec<OrderBookLevel>,
    /// Best asks, lowest first.
    #[serde(rename = "a")]
    pub asks: Vec<OrderBookLevel>,
}

impl BookUpdate {
    /// Render the best `levels` of each side of a replica.
    #[must_use]
    pub fn from_book(book: &LocalOrderBook, levels: usize, event_time: i64) -> Self {
        Self {
            symbol: book.symbol().to_string(),
            event_time,
            bids: book.top_n(levels, BookSide::Bid),
            asks: book.top_n(levels, BookSide::Ask),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::domain::order_book::DepthSnapshot;

    #[test]
    fn mark_price_wire_format() {
        let price = MarkPrice {
            symbol: "BTCUSDT".to_string(),
            price: Decimal::from_str("50000.10").unwrap(),
            event_time: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&price).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"s": "BTCUSDT", "p": "50000.10", "t": 1_700_000_000_000_i64})
        );
    }

    #[test]
    fn book_update_wire_format() {
        let snapshot = DepthSnapshot {
            last_update_id: 1,
            bids: vec![
                OrderBookLevel::new("100", "1"),
                OrderBookLevel::new("101", "2"),
            ],
            asks: vec![OrderBookLevel::new("102", "3")],
        };
        let book = LocalOrderBook::from_snapshot("ETHUSDT", &snapshot);
        let update = BookUpdate::from_book(&book, 1, 42);

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "book",
                "s": "ETHUSDT",
                "t": 42,
                "b": [["101", "2"]],
                "a": [["102", "3"]],
            })
        );
    }
}
