//! Order Book Synchronization
//!
//! State machine that turns an unordered start (diff stream already flowing,
//! snapshot fetched later) into a contiguous replica.
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingBridge -> Synced
//!      ^                                            |
//!      +-------------- gap / overflow --------------+
//! ```
//!
//! While `Connecting` every diff is buffered. Once the snapshot lands the
//! buffer is replayed: events ending at or before the snapshot cursor are
//! discarded, the first survivor must bridge the cursor, and everything after
//! it is applied as a steady-state diff.

use std::collections::VecDeque;

use super::{BookError, BookSide, DepthSnapshot, DiffEvent, LocalOrderBook, OrderBookLevel};

/// Synchronizer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not running. Diffs are refused until [`OrderBookSynchronizer::begin`].
    Disconnected,
    /// Buffering diffs while the snapshot is fetched.
    Connecting,
    /// Snapshot applied, waiting for an event that straddles its cursor.
    AwaitingBridge,
    /// Replica is contiguous and may be published.
    Synced,
}

impl SyncState {
    /// Get the state name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingBridge => "awaiting_bridge",
            Self::Synced => "synced",
        }
    }
}

/// Outcome of feeding one diff to the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProgress {
    /// Held until the snapshot arrives.
    Buffered,
    /// Older than the snapshot, dropped.
    Discarded,
    /// Bridged the snapshot; the replica is now synced.
    Bridged,
    /// Applied in steady state.
    Applied,
}

impl SyncProgress {
    /// Whether the replica changed and should be republished.
    #[must_use]
    pub const fn changed_book(self) -> bool {
        matches!(self, Self::Bridged | Self::Applied)
    }
}

/// Synchronization failures. Every variant except [`SyncError::StaleSnapshot`]
/// leaves the synchronizer `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Diff buffer filled before the snapshot arrived.
    #[error("ingestion buffer overflow ({capacity} events)")]
    BufferOverflow {
        /// Configured buffer capacity.
        capacity: usize,
    },

    /// The first buffered event starts after `snapshot + 1`. The snapshot must
    /// be refetched; buffered events are kept.
    #[error("snapshot {snapshot_id} is stale: first event starts at {first_update_id}")]
    StaleSnapshot {
        /// Snapshot cursor.
        snapshot_id: u64,
        /// `firstUpdateId` of the first surviving event.
        first_update_id: u64,
    },

    /// Diff or snapshot delivered in a state that cannot accept it.
    #[error("unexpected {input} while {state}")]
    UnexpectedInput {
        /// What was delivered.
        input: &'static str,
        /// State name at the time.
        state: &'static str,
    },

    /// The replica rejected an update.
    #[error(transparent)]
    Book(#[from] BookError),
}

/// Per-symbol snapshot + diff synchronizer.
#[derive(Debug)]
pub struct OrderBookSynchronizer {
    symbol: String,
    state: SyncState,
    capacity: usize,
    buffer: VecDeque<DiffEvent>,
    book: Option<LocalOrderBook>,
    last_event_time: Option<i64>,
}

impl OrderBookSynchronizer {
    /// Create a synchronizer whose pre-snapshot buffer holds `capacity` events.
    #[must_use]
    pub fn new(symbol: impl Into<String>, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            state: SyncState::Disconnected,
            capacity: capacity.max(1),
            buffer: VecDeque::new(),
            book: None,
            last_event_time: None,
        }
    }

    /// Symbol being synchronized.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SyncState {
        self.state
    }

    /// The replica, once a snapshot has been applied.
    #[must_use]
    pub const fn book(&self) -> Option<&LocalOrderBook> {
        self.book.as_ref()
    }

    /// Event time of the last diff applied to the replica, including one
    /// replayed from the buffer.
    #[must_use]
    pub const fn last_event_time(&self) -> Option<i64> {
        self.last_event_time
    }

    /// Number of diffs waiting for a snapshot.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Start a new session: discard any previous replica and begin buffering.
    pub fn begin(&mut self) {
        self.buffer.clear();
        self.book = None;
        self.last_event_time = None;
        self.state = SyncState::Connecting;
    }

    /// Drop everything and return to `Disconnected`.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.book = None;
        self.last_event_time = None;
        self.state = SyncState::Disconnected;
    }

    /// Feed one diff from the stream.
    ///
    /// # Errors
    ///
    /// - [`SyncError::BufferOverflow`] when the pre-snapshot buffer is full.
    /// - [`SyncError::StaleSnapshot`] when the awaited bridge is impossible.
    /// - [`SyncError::Book`] on a steady-state continuity failure.
    /// - [`SyncError::UnexpectedInput`] when not started.
    pub fn ingest(&mut self, event: DiffEvent) -> Result<SyncProgress, SyncError> {
        match self.state {
            SyncState::Disconnected => Err(SyncError::UnexpectedInput {
                input: "diff",
                state: self.state.as_str(),
            }),
            SyncState::Connecting => {
                if self.buffer.len() >= self.capacity {
                    self.reset();
                    return Err(SyncError::BufferOverflow {
                        capacity: self.capacity,
                    });
                }
                self.buffer.push_back(event);
                Ok(SyncProgress::Buffered)
            }
            SyncState::AwaitingBridge => self.try_bridge(event),
            SyncState::Synced => self.apply_steady(&event),
        }
    }

    /// Install a snapshot and replay the buffer against it.
    ///
    /// Returns `Synced` if a buffered event bridged the snapshot, otherwise
    /// `AwaitingBridge`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::ingest`]. On [`SyncError::StaleSnapshot`] the
    /// synchronizer is back in `Connecting` with the unconsumed events
    /// buffered, ready for another snapshot.
    pub fn on_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<SyncState, SyncError> {
        if !matches!(
            self.state,
            SyncState::Connecting | SyncState::AwaitingBridge
        ) {
            return Err(SyncError::UnexpectedInput {
                input: "snapshot",
                state: self.state.as_str(),
            });
        }

        self.book = Some(LocalOrderBook::from_snapshot(&self.symbol, snapshot));
        self.last_event_time = None;
        self.state = SyncState::AwaitingBridge;

        let mut pending = std::mem::take(&mut self.buffer).into_iter();
        while let Some(event) = pending.next() {
            if let Err(err) = self.ingest(event) {
                if matches!(err, SyncError::StaleSnapshot { .. }) {
                    self.buffer.extend(pending);
                }
                return Err(err);
            }
        }

        Ok(self.state)
    }

    /// The bridge wait expired: drop the snapshot and buffer again.
    pub fn on_bridge_timeout(&mut self) {
        if self.state == SyncState::AwaitingBridge {
            self.book = None;
            self.state = SyncState::Connecting;
        }
    }

    /// Best levels of one side, empty unless synced.
    #[must_use]
    pub fn top_n(&self, levels: usize, side: BookSide) -> Vec<OrderBookLevel> {
        match (&self.state, &self.book) {
            (SyncState::Synced, Some(book)) => book.top_n(levels, side),
            _ => Vec::new(),
        }
    }

    fn try_bridge(&mut self, event: DiffEvent) -> Result<SyncProgress, SyncError> {
        let Some(book) = self.book.as_mut() else {
            return Err(SyncError::UnexpectedInput {
                input: "diff",
                state: self.state.as_str(),
            });
        };
        let snapshot_id = book.last_update_id();

        if event.last_update_id <= snapshot_id {
            return Ok(SyncProgress::Discarded);
        }

        if event.first_update_id > snapshot_id.saturating_add(1) {
            let first_update_id = event.first_update_id;
            self.book = None;
            self.state = SyncState::Connecting;
            self.buffer.push_back(event);
            return Err(SyncError::StaleSnapshot {
                snapshot_id,
                first_update_id,
            });
        }

        match book.apply_bridge(&event) {
            Ok(()) => {
                self.state = SyncState::Synced;
                self.last_event_time = Some(event.event_time);
                Ok(SyncProgress::Bridged)
            }
            Err(err) => {
                self.reset();
                Err(err.into())
            }
        }
    }

    fn apply_steady(&mut self, event: &DiffEvent) -> Result<SyncProgress, SyncError> {
        let result = match self.book.as_mut() {
            Some(book) => book.apply_diff(event),
            None => Err(BookError::Desynced),
        };

        match result {
            Ok(()) => {
                self.last_event_time = Some(event.event_time);
                Ok(SyncProgress::Applied)
            }
            Err(err) => {
                self.reset();
                Err(err.into())
            }
        }
    }
}
