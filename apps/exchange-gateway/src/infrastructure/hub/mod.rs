//! Subscription Hub
//!
//! Generic fan-out of one upstream feed per key to many downstream clients.
//!
//! # Architecture
//!
//! ```text
//!   FeedSource ──► RoomSink ──► Room ──try_send──► client mailbox (bounded)
//!                                 │   ──try_send──► client mailbox (bounded)
//!   registry: Mutex<HashMap<RoomKey, Arc<Room>>>   ──► ...
//! ```
//!
//! - Rooms are created on first subscribe (atomic get-or-insert under the
//!   registry lock) and start their feed exactly once.
//! - When the last member leaves, teardown is scheduled after a grace window.
//!   It re-checks emptiness under the room lock when it fires, so a
//!   resubscribe inside the window keeps the feed running.
//! - A broadcast never waits on a client: a full mailbox loses that payload
//!   for that client only.
//!
//! The registry lock and a room lock are never held together.

mod room;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use room::{BroadcastStats, Room};
pub use supervisor::run_supervised;

use crate::application::ports::{FeedSink, FeedSource};
use crate::domain::subscription::{ClientId, RoomKey};
use crate::infrastructure::exchange::reconnect::ReconnectConfig;
use crate::infrastructure::feed_state::FeedState;
use crate::infrastructure::metrics::{self, FeedKind};

// =============================================================================
// Configuration
// =============================================================================

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Delay between a room emptying and its teardown.
    pub grace_period: Duration,
    /// Backoff for restarting a room's feed.
    pub reconnect: ReconnectConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The hub has been shut down.
    #[error("subscription hub is shut down")]
    ShutDown,
}

/// Object-safe view of a hub for connection handlers.
pub trait RoomRegistry<P>: Send + Sync {
    /// See [`SubscriptionHub::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ShutDown`] after shutdown.
    fn subscribe(&self, key: &RoomKey, client: ClientId, mailbox: mpsc::Sender<P>) -> Result<(), HubError>;

    /// See [`SubscriptionHub::unsubscribe`].
    fn unsubscribe(&self, key: &RoomKey, client: ClientId) -> bool;

    /// See [`SubscriptionHub::room_count`].
    fn room_count(&self) -> usize;
}

/// Per-room statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStats {
    /// Room key.
    pub key: RoomKey,
    /// Current members.
    pub members: usize,
    /// Whether the feed is running.
    pub upstream_running: bool,
}

// =============================================================================
// Hub
// =============================================================================

struct HubInner<F: FeedSource> {
    feed: Arc<F>,
    rooms: Mutex<HashMap<RoomKey, Arc<Room<F::Payload>>>>,
    config: HubConfig,
    state: Arc<FeedState>,
    cancel: CancellationToken,
}

/// Fan-out hub over one kind of feed. Cheap to clone.
pub struct SubscriptionHub<F: FeedSource> {
    inner: Arc<HubInner<F>>,
}

impl<F: FeedSource> Clone for SubscriptionHub<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: FeedSource> SubscriptionHub<F> {
    /// Create a hub. Rooms stop when `cancel` fires.
    #[must_use]
    pub fn new(feed: Arc<F>, config: HubConfig, cancel: &CancellationToken) -> Self {
        let state = Arc::new(FeedState::new(feed.name()));
        Self {
            inner: Arc::new(HubInner {
                feed,
                rooms: Mutex::new(HashMap::new()),
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

    /// Join `client` to the room for `key`, creating it if needed.
    ///
    /// The last broadcast payload, if any, is queued to `mailbox` immediately.
    /// The first member starts the room's feed.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ShutDown`] after [`Self::shutdown`].
    pub fn subscribe(
        &self,
        key: &RoomKey,
        client: ClientId,
        mailbox: mpsc::Sender<F::Payload>,
    ) -> Result<(), HubError> {
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(HubError::ShutDown);
            }

            let room = self.inner.get_or_create(key);
            match room.join(client, mailbox.clone()) {
                Some(joined) => {
                    if joined.start_upstream {
                        self.inner.start_feed(&room);
                    }
                    tracing::debug!(room = %key, client, "Client subscribed");
                    return Ok(());
                }
                None => self.inner.remove_if_same(&room),
            }
        }
    }

    /// Remove `client` from the room for `key`.
    ///
    /// Returns `false` if it was not a member. When the room becomes empty
    /// its teardown is scheduled after the grace window.
    pub fn unsubscribe(&self, key: &RoomKey, client: ClientId) -> bool {
        let Some(room) = self.inner.rooms.lock().get(key).cloned() else {
            return false;
        };

        match room.leave(client) {
            None => false,
            Some(emptied_at) => {
                if let Some(generation) = emptied_at {
                    self.inner.schedule_teardown(room, generation);
                }
                tracing::debug!(room = %key, client, "Client unsubscribed");
                true
            }
        }
    }

    /// Queue `payload` to every member of the room for `key`.
    ///
    /// Returns `None` when no such room exists.
    pub fn broadcast(&self, key: &RoomKey, payload: F::Payload) -> Option<BroadcastStats> {
        let room = self.inner.rooms.lock().get(key).cloned()?;
        Some(self.inner.broadcast_to(&room, payload))
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner.rooms.lock().len()
    }

    /// Statistics of the room for `key`.
    #[must_use]
    pub fn room_stats(&self, key: &RoomKey) -> Option<RoomStats> {
        let room = self.inner.rooms.lock().get(key).cloned()?;
        Some(RoomStats {
            key: key.clone(),
            members: room.member_count(),
            upstream_running: room.upstream_running(),
        })
    }

    /// Statistics of every room.
    #[must_use]
    pub fn stats(&self) -> Vec<RoomStats> {
        let rooms: Vec<_> = self.inner.rooms.lock().values().cloned().collect();
        rooms
            .iter()
            .map(|room| RoomStats {
                key: room.key().clone(),
                members: room.member_count(),
                upstream_running: room.upstream_running(),
            })
            .collect()
    }

    /// Stop every room and refuse further subscriptions.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let rooms: Vec<_> = self.inner.rooms.lock().drain().map(|(_, room)| room).collect();
        for room in &rooms {
            room.close();
        }
        metrics::set_rooms(self.inner.kind(), 0);
        tracing::info!(feed = self.inner.feed.name(), rooms = rooms.len(), "Hub shut down");
    }
}

impl<F: FeedSource> RoomRegistry<F::Payload> for SubscriptionHub<F> {
    fn subscribe(
        &self,
        key: &RoomKey,
        client: ClientId,
        mailbox: mpsc::Sender<F::Payload>,
    ) -> Result<(), HubError> {
        Self::subscribe(self, key, client, mailbox)
    }

    fn unsubscribe(&self, key: &RoomKey, client: ClientId) -> bool {
        Self::unsubscribe(self, key, client)
    }

    fn room_count(&self) -> usize {
        Self::room_count(self)
    }
}

impl<F: FeedSource> HubInner<F> {
    fn kind(&self) -> FeedKind {
        FeedKind::from_name(self.feed.name())
    }

    fn get_or_create(&self, key: &RoomKey) -> Arc<Room<F::Payload>> {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Room::new(key.clone(), self.cancel.child_token())))
            .clone();
        metrics::set_rooms(self.kind(), rooms.len());
        room
    }

    fn remove_if_same(&self, room: &Arc<Room<F::Payload>>) {
        let mut rooms = self.rooms.lock();
        if rooms
            .get(room.key())
            .is_some_and(|existing| Arc::ptr_eq(existing, room))
        {
            rooms.remove(room.key());
        }
        metrics::set_rooms(self.kind(), rooms.len());
    }

    fn broadcast_to(&self, room: &Room<F::Payload>, payload: F::Payload) -> BroadcastStats {
        let stats = room.broadcast(payload);
        let kind = self.kind();
        if stats.delivered > 0 {
            metrics::record_frames_sent(kind, stats.delivered);
        }
        if stats.dropped > 0 {
            metrics::record_frames_dropped(kind, stats.dropped);
            tracing::debug!(room = %room.key(), dropped = stats.dropped, "Dropped payload for slow clients");
        }
        stats
    }

    fn start_feed(self: &Arc<Self>, room: &Arc<Room<F::Payload>>) {
        let sink: Arc<dyn FeedSink<F::Payload>> = Arc::new(RoomSink {
            room: Arc::clone(room),
            hub: Arc::downgrade(self),
        });
        let feed = Arc::clone(&self.feed);
        let state = Arc::clone(&self.state);
        let key = room.key().clone();
        let cancel = room.cancel_token();
        let reconnect = self.config.reconnect.clone();

        tracing::info!(feed = feed.name(), room = %key, "Starting feed");
        let room = Arc::clone(room);
        tokio::spawn(async move {
            run_supervised(feed.as_ref(), &key, sink, state, cancel, reconnect).await;
            room.upstream_stopped();
        });
    }

    fn schedule_teardown(self: &Arc<Self>, room: Arc<Room<F::Payload>>, generation: u64) {
        let hub = Arc::clone(self);
        let grace = self.config.grace_period;

        tokio::spawn(async move {
            let room_cancel = room.cancel_token();
            tokio::select! {
                () = tokio::time::sleep(grace) => {}
                () = room_cancel.cancelled() => return,
            }

            if room.close_if_idle(generation) {
                hub.remove_if_same(&room);
                tracing::info!(room = %room.key(), "Room torn down");
            }
        });
    }
}

/// Sink handed to a room's feed.
struct RoomSink<F: FeedSource> {
    room: Arc<Room<F::Payload>>,
    hub: Weak<HubInner<F>>,
}

impl<F: FeedSource> FeedSink<F::Payload> for RoomSink<F> {
    fn publish(&self, payload: F::Payload) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let stats = hub.broadcast_to(&self.room, payload);
        if stats.emptied {
            let generation = self.room.generation();
            hub.schedule_teardown(Arc::clone(&self.room), generation);
        }
    }

    fn connected(&self) {
        tracing::debug!(room = %self.room.key(), "Feed connected");
    }
}
