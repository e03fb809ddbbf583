//! Local Order Book Replica
//!
//! A per-symbol copy of the exchange price ladder, bootstrapped from a REST
//! snapshot and advanced by the ordered diff stream.
//!
//! # Invariants
//!
//! - Every stored level has a strictly positive quantity. A zero or empty
//!   quantity in an update deletes the level and is never stored.
//! - `last_update_id` only moves forward, and only through a fully validated
//!   diff or a snapshot replacement.
//! - Once a diff is rejected for broken continuity the book refuses every
//!   further application; the owner must discard it and resynchronize.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod sync;

pub use sync::{OrderBookSynchronizer, SyncError, SyncProgress, SyncState};

// =============================================================================
// Types
// =============================================================================

/// A single price level, kept as the exchange's decimal strings.
///
/// Serialized as a `[price, quantity]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[String; 2]", into = "[String; 2]")]
pub struct OrderBookLevel {
    /// Price as sent by the exchange.
    pub price: String,
    /// Quantity as sent by the exchange.
    pub quantity: String,
}

impl OrderBookLevel {
    /// Create a level from price and quantity strings.
    #[must_use]
    pub fn new(price: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            quantity: quantity.into(),
        }
    }
}

impl From<[String; 2]> for OrderBookLevel {
    fn from([price, quantity]: [String; 2]) -> Self {
        Self { price, quantity }
    }
}

impl From<OrderBookLevel> for [String; 2] {
    fn from(level: OrderBookLevel) -> Self {
        [level.price, level.quantity]
    }
}

/// Side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookSide {
    /// Buy side, best price is the highest.
    Bid,
    /// Sell side, best price is the lowest.
    Ask,
}

/// Point-in-time book state returned by the REST snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepthSnapshot {
    /// Sequence cursor of the snapshot.
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    /// Bid levels.
    pub bids: Vec<OrderBookLevel>,
    /// Ask levels.
    pub asks: Vec<OrderBookLevel>,
}

/// Incremental book update carrying sequence-linkage fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEvent {
    /// First update id covered by this event.
    pub first_update_id: u64,
    /// Last update id covered by this event.
    pub last_update_id: u64,
    /// Last update id of the previous event in the stream.
    pub prev_last_update_id: u64,
    /// Exchange event time in milliseconds.
    pub event_time: i64,
    /// Changed bid levels.
    pub bids: Vec<OrderBookLevel>,
    /// Changed ask levels.
    pub asks: Vec<OrderBookLevel>,
}

impl DiffEvent {
    /// Whether this event can bridge a snapshot with cursor `snapshot_id`,
    /// i.e. `first_update_id <= snapshot_id + 1 <= last_update_id`.
    #[must_use]
    pub const fn bridges(&self, snapshot_id: u64) -> bool {
        let next = snapshot_id.saturating_add(1);
        self.first_update_id <= next && next <= self.last_update_id
    }
}

/// Errors raised when applying updates to a [`LocalOrderBook`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookError {
    /// The diff does not continue from the book's cursor.
    #[error("sequence gap: expected prevLastUpdateId {expected}, received {received}")]
    SequenceGap {
        /// The book's current cursor.
        expected: u64,
        /// The event's `prevLastUpdateId`.
        received: u64,
    },

    /// The event would move the cursor backwards.
    #[error("sequence regression: book at {current}, event ends at {received}")]
    Regression {
        /// The book's current cursor.
        current: u64,
        /// The event's `lastUpdateId`.
        received: u64,
    },

    /// The event does not straddle the snapshot cursor.
    #[error("event [{first}, {last}] does not bridge snapshot {snapshot_id}")]
    NotBridging {
        /// Snapshot cursor.
        snapshot_id: u64,
        /// Event first update id.
        first: u64,
        /// Event last update id.
        last: u64,
    },

    /// The book previously rejected an update and must be rebuilt.
    #[error("order book is desynchronized and must be rebuilt")]
    Desynced,
}

// =============================================================================
// Local Order Book
// =============================================================================

/// Local replica of one symbol's order book.
///
/// # Example
///
/// ```rust
/// use exchange_gateway::domain::order_book::{
///     BookSide, DepthSnapshot, DiffEvent, LocalOrderBook, OrderBookLevel,
/// };
///
/// let snapshot = DepthSnapshot {
///     last_update_id: 100,
///     bids: vec![OrderBookLevel::new("50000", "1")],
///     asks: vec![OrderBookLevel::new("50010", "1")],
/// };
/// let mut book = LocalOrderBook::from_snapshot("BTCUSDT", &snapshot);
///
/// book.apply_diff(&DiffEvent {
///     first_update_id: 101,
///     last_update_id: 102,
///     prev_last_update_id: 100,
///     event_time: 0,
///     bids: vec![OrderBookLevel::new("50000", "0")],
///     asks: vec![],
/// })
/// .unwrap();
///
/// assert_eq!(book.last_update_id(), 102);
/// assert!(book.top_n(10, BookSide::Bid).is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct LocalOrderBook {
    symbol: String,
    last_update_id: u64,
    bids: BTreeMap<Decimal, OrderBookLevel>,
    asks: BTreeMap<Decimal, OrderBookLevel>,
    desynced: bool,
}

impl LocalOrderBook {
    /// Build a fresh book from a snapshot.
    #[must_use]
    pub fn from_snapshot(symbol: impl Into<String>, snapshot: &DepthSnapshot) -> Self {
        let mut book = Self {
            symbol: symbol.into(),
            last_update_id: snapshot.last_update_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            desynced: false,
        };
        book.apply_levels(BookSide::Bid, &snapshot.bids);
        book.apply_levels(BookSide::Ask, &snapshot.asks);
        book
    }

    /// Symbol this book tracks.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current sequence cursor.
    #[must_use]
    pub const fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Whether the book rejected an update and can no longer be advanced.
    #[must_use]
    pub const fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Apply the first event after the snapshot.
    ///
    /// The bridging event is validated against the snapshot cursor rather than
    /// through `prev_last_update_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BookError::NotBridging`] if the event does not straddle the
    /// cursor, or [`BookError::Desynced`] if the book was already rejected.
    pub fn apply_bridge(&mut self, event: &DiffEvent) -> Result<(), BookError> {
        if self.desynced {
            return Err(BookError::Desynced);
        }
        if !event.bridges(self.last_update_id) {
            return Err(BookError::NotBridging {
                snapshot_id: self.last_update_id,
                first: event.first_update_id,
                last: event.last_update_id,
            });
        }

        self.apply_event(event);
        Ok(())
    }

    /// Apply a steady-state diff.
    ///
    /// # Errors
    ///
    /// Returns [`BookError::SequenceGap`] when `prev_last_update_id` does not
    /// match the cursor. The book is then marked desynced and every later call
    /// returns [`BookError::Desynced`].
    pub fn apply_diff(&mut self, event: &DiffEvent) -> Result<(), BookError> {
        if self.desynced {
            return Err(BookError::Desynced);
        }
        if event.prev_last_update_id != self.last_update_id {
            self.desynced = true;
            return Err(BookError::SequenceGap {
                expected: self.last_update_id,
                received: event.prev_last_update_id,
            });
        }
        if event.last_update_id < self.last_update_id {
            self.desynced = true;
            return Err(BookError::Regression {
                current: self.last_update_id,
                received: event.last_update_id,
            });
        }

        self.apply_event(event);
        Ok(())
    }

    /// Best `levels` entries of one side: bids descending, asks ascending.
    #[must_use]
    pub fn top_n(&self, levels: usize, side: BookSide) -> Vec<OrderBookLevel> {
        match side {
            BookSide::Bid => self.bids.values().rev().take(levels).cloned().collect(),
            BookSide::Ask => self.asks.values().take(levels).cloned().collect(),
        }
    }

    /// Stored quantity at `price`, if the level exists.
    #[must_use]
    pub fn quantity(&self, side: BookSide, price: &str) -> Option<&str> {
        let key = Decimal::from_str(price).ok()?;
        self.side(side).get(&key).map(|level| level.quantity.as_str())
    }

    /// Number of stored levels on one side.
    #[must_use]
    pub fn depth(&self, side: BookSide) -> usize {
        self.side(side).len()
    }

    const fn side(&self, side: BookSide) -> &BTreeMap<Decimal, OrderBookLevel> {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }

    fn apply_event(&mut self, event: &DiffEvent) {
        self.apply_levels(BookSide::Bid, &event.bids);
        self.apply_levels(BookSide::Ask, &event.asks);
        self.last_update_id = event.last_update_id;
    }

    fn apply_levels(&mut self, side: BookSide, levels: &[OrderBookLevel]) {
        let map = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };

        for level in levels {
            match classify(level) {
                Some(LevelChange::Upsert(price)) => {
                    map.insert(price, level.clone());
                }
                Some(LevelChange::Remove(price)) => {
                    map.remove(&price);
                }
                None => {
                    tracing::trace!(
                        price = %level.price,
                        quantity = %level.quantity,
                        "Dropping malformed book level"
                    );
                }
            }
        }
    }
}

// =============================================================================
// Level Parsing
// =============================================================================

enum LevelChange {
    Upsert(Decimal),
    Remove(Decimal),
}

/// Parse a level defensively. `None` means the level is dropped.
fn classify(level: &OrderBookLevel) -> Option<LevelChange> {
    let price = Decimal::from_str(level.price.trim()).ok()?;
    if price <= Decimal::ZERO {
        return None;
    }

    let quantity = level.quantity.trim();
    if quantity.is_empty() {
        return Some(LevelChange::Remove(price));
    }

    let quantity = Decimal::from_str(quantity).ok()?;
    if quantity.is_zero() {
        Some(LevelChange::Remove(price))
    } else if quantity.is_sign_negative() {
        None
    } else {
        Some(LevelChange::Upsert(price))
    }
}
