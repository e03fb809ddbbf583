//! Subscription Management Types
//!
//! Room keys, the downstream client protocol and per-client subscription
//! tracking.
//!
//! # Design
//!
//! A room is identified by a [`RoomKey`]: `SYMBOL` for the price stream or
//! `SYMBOL:levels` for a depth-limited order book. Many clients share one
//! room, and each client tracks which rooms it holds so they can all be
//! released when it disconnects.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream client connection.
pub type ClientId = u64;

/// Maximum accepted symbol length.
pub const MAX_SYMBOL_LEN: usize = 20;

/// Order book depth used when a client does not ask for one.
pub const DEFAULT_BOOK_LEVELS: usize = 20;

/// Largest depth a client may ask for.
pub const MAX_BOOK_LEVELS: usize = 1000;

/// Errors produced while interpreting client input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Symbol is empty, too long or contains invalid characters.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Depth is zero or above the maximum.
    #[error("invalid depth {0}, expected 1..={MAX_BOOK_LEVELS}")]
    InvalidLevels(usize),

    /// Room key could not be parsed.
    #[error("invalid room key: {0:?}")]
    InvalidKey(String),

    /// Client frame was not a valid request.
    #[error("malformed client request: {0}")]
    MalformedRequest(String),
}

/// Normalize a symbol to upper case and validate it.
///
/// # Errors
///
/// Returns [`SubscriptionError::InvalidSymbol`] if the symbol is empty, longer
/// than [`MAX_SYMBOL_LEN`] or not ASCII alphanumeric.
pub fn normalize_symbol(raw: &str) -> Result<String, SubscriptionError> {
    let symbol = raw.trim();
    if symbol.is_empty()
        || symbol.len() > MAX_SYMBOL_LEN
        || !symbol.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(SubscriptionError::InvalidSymbol(raw.to_string()));
    }
    Ok(symbol.to_ascii_uppercase())
}

// =============================================================================
// Room Key
// =============================================================================

/// Identifies one fan-out room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    symbol: String,
    levels: Option<usize>,
}

impl RoomKey {
    /// Key for a symbol's price stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is invalid.
    pub fn price(symbol: &str) -> Result<Self, SubscriptionError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            levels: None,
        })
    }

    /// Key for a symbol's order book truncated to `levels`.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol or depth is invalid.
    pub fn book(symbol: &str, levels: usize) -> Result<Self, SubscriptionError> {
        if levels == 0 || levels > MAX_BOOK_LEVELS {
            return Err(SubscriptionError::InvalidLevels(levels));
        }
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            levels: Some(levels),
        })
    }

    /// Parse `SYMBOL` or `SYMBOL:levels`.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is invalid.
    pub fn parse(raw: &str) -> Result<Self, SubscriptionError> {
        match raw.split_once(':') {
            None => Self::price(raw),
            Some((symbol, levels)) => {
                let levels = levels
                    .parse::<usize>()
                    .map_err(|_| SubscriptionError::InvalidKey(raw.to_string()))?;
                Self::book(symbol, levels)
            }
        }
    }

    /// Symbol of the room.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Requested depth for order book rooms.
    #[must_use]
    pub const fn levels(&self) -> Option<usize> {
        self.levels
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.levels {
            Some(levels) => write!(f, "{}:{levels}", self.symbol),
            None => f.write_str(&self.symbol),
        }
    }
}

// =============================================================================
// Client Protocol
// =============================================================================

/// Action requested by a downstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    /// Join a room.
    Subscribe,
    /// Leave a room.
    Unsubscribe,
    /// Application-level keepalive.
    Ping,
}

/// Client to server text frame: `{"action": "...", "symbol": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Requested action.
    pub action: ClientAction,
    /// Target symbol, unused for `ping`.
    #[serde(default)]
    pub symbol: Option<String>,
}

impl ClientRequest {
    /// Parse a client text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::MalformedRequest`] for invalid JSON or an
    /// unknown action.
    pub fn parse(text: &str) -> Result<Self, SubscriptionError> {
        serde_json::from_str(text).map_err(|e| SubscriptionError::MalformedRequest(e.to_string()))
    }

    /// Resolve the room this request targets, given the connection's depth.
    ///
    /// # Errors
    ///
    /// Returns an error when the symbol is missing or invalid.
    pub fn room_key(&self, levels: Option<usize>) -> Result<RoomKey, SubscriptionError> {
        let symbol = self
            .symbol
            .as_deref()
            .ok_or_else(|| SubscriptionError::InvalidSymbol(String::new()))?;
        match levels {
            Some(levels) => RoomKey::book(symbol, levels),
            None => RoomKey::price(symbol),
        }
    }
}

/// Server to client control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerNotice {
    /// Reply to an application-level ping.
    Pong,
    /// Subscription acknowledged.
    Subscribed {
        /// Room symbol.
        symbol: String,
    },
    /// Unsubscription acknowledged.
    Unsubscribed {
        /// Room symbol.
        symbol: String,
    },
    /// Request rejected.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

// =============================================================================
// Client Subscriptions
// =============================================================================

/// Rooms held by one client connection.
#[derive(Debug, Default)]
pub struct ClientSubscriptions {
    rooms: HashSet<RoomKey>,
}

impl ClientSubscriptions {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a room. Returns `false` if it was already held.
    pub fn add(&mut self, key: RoomKey) -> bool {
        self.rooms.insert(key)
    }

    /// Forget a room. Returns `false` if it was not held.
    pub fn remove(&mut self, key: &RoomKey) -> bool {
        self.rooms.remove(key)
    }

    /// Whether the room is held.
    #[must_use]
    pub fn contains(&self, key: &RoomKey) -> bool {
        self.rooms.contains(key)
    }

    /// Number of rooms held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether no rooms are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Take every held room, leaving the set empty.
    pub fn drain(&mut self) -> Vec<RoomKey> {
        self.rooms.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("btcusdt", "BTCUSDT" ; "lower case")]
    #[test_case(" ETHUSDT ", "ETHUSDT" ; "padded")]
    #[test_case("1000PEPEUSDT", "1000PEPEUSDT" ; "digits")]
    fn normalize_accepts(raw: &str, expected: &str) {
        assert_eq!(normalize_symbol(raw).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("BTC-USDT" ; "dash")]
    #[test_case("BTC/USDT" ; "slash")]
    #[test_case("ABCDEFGHIJKLMNOPQRSTUVWXYZ" ; "too long")]
    fn normalize_rejects(raw: &str) {
        assert!(matches!(
            normalize_symbol(raw),
            Err(SubscriptionError::InvalidSymbol(_))
        ));
    }

    #[test]
    fn room_key_display_round_trip() {
        let price = RoomKey::price("btcusdt").unwrap();
        assert_eq!(price.to_string(), "BTCUSDT");
        assert_eq!(RoomKey::parse("BTCUSDT").unwrap(), price);

        let book = RoomKey::book("btcusdt", 20).unwrap();
        assert_eq!(book.to_string(), "BTCUSDT:20");
        assert_eq!(RoomKey::parse("BTCUSDT:20").unwrap(), book);
        assert_ne!(price, book);
    }

    #[test_case("BTCUSDT:0" ; "zero depth")]
    #[test_case("BTCUSDT:abc" ; "non numeric")]
    #[test_case("BTCUSDT:5000" ; "too deep")]
    fn room_key_parse_rejects(raw: &str) {
        assert!(RoomKey::parse(raw).is_err());
    }

    #[test]
    fn parse_client_requests() {
        let req = ClientRequest::parse(r#"{"action":"subscribe","symbol":"ethusdt"}"#).unwrap();
        assert_eq!(req.action, ClientAction::Subscribe);
        assert_eq!(req.room_key(None).unwrap().to_string(), "ETHUSDT");
        assert_eq!(req.room_key(Some(10)).unwrap().to_string(), "ETHUSDT:10");

        let ping = ClientRequest::parse(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(ping.action, ClientAction::Ping);
        assert!(ping.room_key(None).is_err());

        assert!(ClientRequest::parse(r#"{"action":"trade","symbol":"X"}"#).is_err());
        assert!(ClientRequest::parse("not json").is_err());
    }

    #[test]
    fn server_notices_are_tagged() {
        let json = serde_json::to_string(&ServerNotice::Subscribed {
            symbol: "BTCUSDT".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"subscribed","symbol":"BTCUSDT"}"#);
        assert_eq!(
            serde_json::to_string(&ServerNotice::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
    }

    #[test]
    fn client_subscriptions_track_rooms() {
        let mut subs = ClientSubscriptions::new();
        let key = RoomKey::price("BTCUSDT").unwrap();

        assert!(subs.add(key.clone()));
        assert!(!subs.add(key.clone()));
        assert!(subs.contains(&key));
        assert_eq!(subs.len(), 1);

        let drained = subs.drain();
        assert_eq!(drained, vec![key]);
        assert!(subs.is_empty());
    }
}
