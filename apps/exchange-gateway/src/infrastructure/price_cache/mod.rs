//! Mark Price Cache
//!
//! Freshest mark price per symbol for request/response callers (order
//! sizing, risk checks) that cannot consume a stream.
//!
//! Each subscribed symbol owns one supervised mark price feed. A value is
//! fresh for the TTL after it was received. `get` on a stale or unknown
//! symbol subscribes and polls until a fresh value arrives or the wait
//! bound expires.
//!
//! Entries, their feed tokens and their values share one lock, so
//! `unsubscribe` stops the feed and purges the value atomically. A late
//! publish from a stopped feed is ignored.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedSink, FeedSource};
use crate::domain::streaming::MarkPrice;
use crate::domain::subscription::{RoomKey, SubscriptionError};
use crate::infrastructure::exchange::reconnect::ReconnectConfig;
use crate::infrastructure::feed_state::FeedState;
use crate::infrastructure::hub::run_supervised;
use crate::infrastructure::metrics;

/// Price cache errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceCacheError {
    /// No fresh price arrived within the wait bound.
    #[error("no fresh price for {symbol} within {waited:?}")]
    Timeout {
        /// Symbol.
        symbol: String,
        /// Time waited.
        waited: Duration,
    },

    /// The symbol is not valid.
    #[error(transparent)]
    InvalidSymbol(#[from] SubscriptionError),

    /// The cache has been shut down.
    #[error("price cache is shut down")]
    ShutDown,
}

/// Cache timing.
#[derive(Debug, Clone)]
pub struct PriceCacheConfig {
    /// How long a received price stays fresh.
    pub ttl: Duration,
    /// Poll cadence while waiting for a fresh price.
    pub poll_interval: Duration,
    /// Longest `get` waits.
    pub wait_timeout: Duration,
    /// Backoff for restarting a symbol's feed.
    pub reconnect: ReconnectConfig,
}

impl Default for PriceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
        }
    }
}

struct Entry {
    price: Option<(MarkPrice, Instant)>,
    cancel: CancellationToken,
}

struct Inner<F> {
    feed: Arc<F>,
    entries: Mutex<HashMap<String, Entry>>,
    config: PriceCacheConfig,
    state: Arc<FeedState>,
    cancel: CancellationToken,
}

/// Mark price cache. Cheap to clone.
pub struct PriceCache<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for PriceCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: FeedSource<Payload = MarkPrice>> PriceCache<F> {
    /// Create an empty cache. Feeds stop when `cancel` fires.
    #[must_use]
    pub fn new(feed: Arc<F>, config: PriceCacheConfig, cancel: &CancellationToken) -> Self {
        let state = Arc::new(FeedState::new(feed.name()));
        Self {
            inner: Arc::new(Inner {
                feed,
                entries: Mutex::new(HashMap::new()),
                config,
                state,
                cancel: cancel.child_token(),
            }),
        }
    }

    /// Feed state shared with the health endpoint.
    #[must_use]
    pub fn feed_state(&self) -> Arc<FeedState> {
        Arc::clone(&self.inner.state)
    }

    /// Fresh price of `symbol`, waiting for one if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`PriceCacheError::Timeout`] when nothing fresh arrives within
    /// the wait bound, [`PriceCacheError::InvalidSymbol`] for a malformed
    /// symbol and [`PriceCacheError::ShutDown`] after shutdown.
    pub async fn get(&self, symbol: &str) -> Result<MarkPrice, PriceCacheError> {
        let key = RoomKey::price(symbol)?;
        let symbol = key.symbol();

        if let Some(price) = self.fresh(symbol) {
            metrics::record_price_lookup("hit");
            return Ok(price);
        }

        self.subscribe_key(&key)?;

        let started = Instant::now();
        let deadline = started + self.inner.config.wait_timeout;
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => return Err(PriceCacheError::ShutDown),
                _ = ticker.tick() => {}
            }

            if let Some(price) = self.fresh(symbol) {
                metrics::record_price_lookup("filled");
                return Ok(price);
            }
            if Instant::now() >= deadline {
                metrics::record_price_lookup("timeout");
                tracing::warn!(symbol, waited_ms = started.elapsed().as_millis(), "No fresh mark price");
                return Err(PriceCacheError::Timeout {
                    symbol: symbol.to_string(),
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Cached price of `symbol` and its age, fresh or not.
    #[must_use]
    pub fn peek(&self, symbol: &str) -> Option<(MarkPrice, Duration)> {
        let key = RoomKey::price(symbol).ok()?;
        let entries = self.inner.entries.lock();
        let (price, received) = entries.get(key.symbol())?.price.as_ref()?;
        Some((price.clone(), received.elapsed()))
    }

    /// Start tracking `symbol`. Returns `false` if it was already tracked.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed symbol or after shutdown.
    pub fn subscribe(&self, symbol: &str) -> Result<bool, PriceCacheError> {
        self.subscribe_key(&RoomKey::price(symbol)?)
    }

    /// Stop tracking `symbol` and purge its price. Returns `false` if it was
    /// not tracked.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let Ok(key) = RoomKey::price(symbol) else {
            return false;
        };
        let mut entries = self.inner.entries.lock();
        match entries.remove(key.symbol()) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(symbol = key.symbol(), "Price cache unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Tracked symbols.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.inner.entries.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Stop every feed and clear the cache.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut entries = self.inner.entries.lock();
        for (_, entry) in entries.drain() {
            entry.cancel.cancel();
        }
    }

    fn fresh(&self, symbol: &str) -> Option<MarkPrice> {
        let entries = self.inner.entries.lock();
        let (price, received) = entries.get(symbol)?.price.as_ref()?;
        (received.elapsed() < self.inner.config.ttl).then(|| price.clone())
    }

    fn subscribe_key(&self, key: &RoomKey) -> Result<bool, PriceCacheError> {
        if self.inner.cancel.is_cancelled() {
            return Err(PriceCacheError::ShutDown);
        }

        let cancel = {
            let mut entries = self.inner.entries.lock();
            if entries.contains_key(key.symbol()) {
                return Ok(false);
            }
            let cancel = self.inner.cancel.child_token();
            entries.insert(
                key.symbol().to_string(),
                Entry {
                    price: None,
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        let sink: Arc<dyn FeedSink<MarkPrice>> = Arc::new(CacheSink {
            symbol: key.symbol().to_string(),
            cancel: cancel.clone(),
            inner: Arc::downgrade(&self.inner),
        });
        let feed = Arc::clone(&self.inner.feed);
        let state = Arc::clone(&self.inner.state);
        let reconnect = self.inner.config.reconnect.clone();
        let key = key.clone();

        tracing::debug!(symbol = key.symbol(), "Price cache subscribed");
        tokio::spawn(async move {
            run_supervised(feed.as_ref(), &key, sink, state, cancel, reconnect).await;
        });
        Ok(true)
    }
}

/// Writes a feed's prices into its cache entry.
struct CacheSink<F> {
    symbol: String,
    cancel: CancellationToken,
    inner: Weak<Inner<F>>,
}

impl<F: Send + Sync> FeedSink<MarkPrice> for CacheSink<F> {
    fn publish(&self, payload: MarkPrice) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut entries = inner.entries.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(entry) = entries.get_mut(&self.symbol) {
            entry.price = Some((payload, Instant::now()));
        }
    }

    fn connected(&self) {
        tracing::debug!(symbol = %self.symbol, "Price feed connected");
    }
}
