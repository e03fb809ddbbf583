//! Feed State Tracking
//!
//! Connection state and counters for each upstream feed, updated by the feed
//! supervisors and the trading client and read by the health endpoint.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Established.
    Connected,
    /// Waiting out a backoff delay.
    Reconnecting,
}

impl ConnectionState {
    /// Get the state name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Point-in-time view of a [`FeedState`].
#[derive(Debug, Clone, Serialize)]
pub struct FeedInfo {
    /// Most recent state transition.
    pub state: ConnectionState,
    /// Whether at least one session is connected.
    pub connected: bool,
    /// Currently connected sessions.
    pub sessions: usize,
    /// Messages received.
    pub messages_received: u64,
    /// Consecutive reconnect attempts of the most recent failing session.
    pub reconnect_attempts: u32,
    /// Last successful connect.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Shared state of one feed. A feed may run many sessions (one per room).
#[derive(Debug)]
pub struct FeedState {
    name: &'static str,
    state: RwLock<ConnectionState>,
    sessions: AtomicUsize,
    reconnect_attempts: AtomicU32,
    messages_received: AtomicU64,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl FeedState {
    /// Create state for a named feed.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: RwLock::new(ConnectionState::Disconnected),
            sessions: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            messages_received: AtomicU64::new(0),
            last_connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Feed name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// A session started connecting. Ignored while another session is up.
    pub fn connecting(&self) {
        if self.sessions.load(Ordering::Relaxed) == 0 {
            *self.state.write() = ConnectionState::Connecting;
        }
    }

    /// A session connected.
    pub fn connected(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        *self.state.write() = ConnectionState::Connected;
        *self.last_connected_at.write() = Some(Utc::now());
        *self.last_error.write() = None;
    }

    /// A session ended. `was_connected` must match whether
    /// [`Self::connected`] was called for it.
    pub fn session_ended(&self, was_connected: bool, error: Option<String>) {
        if was_connected {
            let _ = self
                .sessions
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
        if let Some(error) = error {
            *self.last_error.write() = Some(error);
        }
        if self.sessions.load(Ordering::Relaxed) == 0 {
            *self.state.write() = ConnectionState::Disconnected;
        }
    }

    /// A session is backing off before attempt `attempt`.
    pub fn reconnecting(&self, attempt: u32) {
        self.reconnect_attempts.store(attempt, Ordering::Relaxed);
        if self.sessions.load(Ordering::Relaxed) == 0 {
            *self.state.write() = ConnectionState::Reconnecting;
        }
    }

    /// Count a received message.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Current state: `Connected` while any session is up, otherwise the
    /// last transition recorded.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.sessions.load(Ordering::Relaxed) > 0 {
            return ConnectionState::Connected;
        }
        *self.state.read()
    }

    /// Snapshot for reporting.
    #[must_use]
    pub fn info(&self) -> FeedInfo {
        let sessions = self.sessions.load(Ordering::Relaxed);
        FeedInfo {
            state: self.state(),
            connected: sessions > 0,
            sessions,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}
