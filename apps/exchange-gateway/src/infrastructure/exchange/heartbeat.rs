//! Heartbeat and Liveness
//!
//! Every inbound frame (data, ping or pong) renews a connection's read
//! deadline. A ping is written on a fixed cadence shorter than the deadline so
//! an idle but healthy peer always has something to answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::time::{Interval, MissedTickBehavior};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between outbound pings.
    pub ping_interval: Duration,
    /// Maximum silence before the connection is considered dead.
    pub read_deadline: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::with_read_deadline(Duration::from_secs(60))
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, read_deadline: Duration) -> Self {
        Self {
            ping_interval,
            read_deadline,
        }
    }

    /// Ping at nine tenths of the read deadline.
    #[must_use]
    pub fn with_read_deadline(read_deadline: Duration) -> Self {
        Self {
            ping_interval: read_deadline.mul_f64(0.9),
            read_deadline,
        }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            read_deadline: settings.heartbeat_timeout,
        }
    }

    /// Ticker for outbound pings. The first tick fires one interval from now.
    #[must_use]
    pub fn ping_ticker(&self) -> Interval {
        let period = self.ping_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }
}

/// Liveness shared between a connection's pumps and its observers.
#[derive(Debug)]
pub struct Liveness {
    last_frame: RwLock<Instant>,
    frames: AtomicU64,
    pings_sent: AtomicU64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// Create liveness state starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_frame: RwLock::new(Instant::now()),
            frames: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
        }
    }

    /// Record an inbound frame.
    pub fn record_frame(&self) {
        *self.last_frame.write() = Instant::now();
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound ping.
    pub fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_frame.read().elapsed()
    }

    /// Inbound frames seen.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Pings written.
    #[must_use]
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }
}
