//! Fan-out Room
//!
//! One room per key. Membership, the upstream lifecycle flag and the last
//! payload live behind the room's own lock; the registry lock is never held
//! at the same time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::{ClientId, RoomKey};

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Members the payload was queued for.
    pub delivered: u64,
    /// Members whose mailbox was full.
    pub dropped: u64,
    /// Members removed because their mailbox was closed.
    pub pruned: u64,
    /// Whether pruning left the room empty.
    pub emptied: bool,
}

struct RoomState<P> {
    members: HashMap<ClientId, mpsc::Sender<P>>,
    upstream_running: bool,
    last_payload: Option<P>,
    /// Bumped on every membership change; a pending teardown only proceeds if
    /// the generation it captured is still current.
    generation: u64,
}

/// Outcome of adding a member.
pub(super) struct Joined {
    /// The caller must start the upstream feed.
    pub start_upstream: bool,
}

/// A fan-out room.
pub struct Room<P> {
    key: RoomKey,
    state: Mutex<RoomState<P>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl<P: Clone> Room<P> {
    pub(super) fn new(key: RoomKey, cancel: CancellationToken) -> Self {
        Self {
            key,
            state: Mutex::new(RoomState {
                members: HashMap::new(),
                upstream_running: false,
                last_payload: None,
                generation: 0,
            }),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    /// Room key.
    #[must_use]
    pub const fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Token cancelled when the room is torn down.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the room has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Whether the upstream feed has been started.
    #[must_use]
    pub fn upstream_running(&self) -> bool {
        self.state.lock().upstream_running
    }

    /// Last broadcast payload.
    #[must_use]
    pub fn last_payload(&self) -> Option<P> {
        self.state.lock().last_payload.clone()
    }

    /// Add a member and replay the last payload to it.
    ///
    /// Returns `None` if the room was closed in the meantime.
    pub(super) fn join(&self, client: ClientId, mailbox: mpsc::Sender<P>) -> Option<Joined> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return None;
        }

        if let Some(payload) = &state.last_payload {
            let _ = mailbox.try_send(payload.clone());
        }
        state.members.insert(client, mailbox);
        state.generation += 1;

        let start_upstream = !state.upstream_running;
        state.upstream_running = true;
        Some(Joined { start_upstream })
    }

    /// Remove a member.
    ///
    /// Returns `None` if it was not a member, otherwise the generation to
    /// tear down at when the room became empty.
    pub(super) fn leave(&self, client: ClientId) -> Option<Option<u64>> {
        let mut state = self.state.lock();
        state.members.remove(&client)?;
        state.generation += 1;
        Some(state.members.is_empty().then_some(state.generation))
    }

    /// The feed ended without the room closing; the next join restarts it.
    pub(super) fn upstream_stopped(&self) {
        let mut state = self.state.lock();
        if !self.is_closed() {
            state.upstream_running = false;
        }
    }

    /// Close the room if it is still empty at `generation`.
    pub(super) fn close_if_idle(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if self.is_closed() || !state.members.is_empty() || state.generation != generation {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        state.upstream_running = false;
        state.last_payload = None;
        drop(state);

        self.cancel.cancel();
        true
    }

    /// Force-close the room regardless of membership.
    pub(super) fn close(&self) {
        let mut state = self.state.lock();
        self.closed.store(true, Ordering::SeqCst);
        state.members.clear();
        state.upstream_running = false;
        drop(state);

        self.cancel.cancel();
    }

    /// Queue `payload` for every member without blocking.
    ///
    /// A full mailbox drops this payload for that member only. A closed
    /// mailbox removes the member.
    pub fn broadcast(&self, payload: P) -> BroadcastStats {
        let mut stats = BroadcastStats::default();
        let mut state = self.state.lock();
        if self.is_closed() {
            return stats;
        }

        let mut stale = Vec::new();
        for (client, mailbox) in &state.members {
            match mailbox.try_send(payload.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(TrySendError::Full(_)) => stats.dropped += 1,
                Err(TrySendError::Closed(_)) => stale.push(*client),
            }
        }

        if !stale.is_empty() {
            for client in &stale {
                state.members.remove(client);
            }
            stats.pruned = stale.len() as u64;
            if state.members.is_empty() {
                state.generation += 1;
                stats.emptied = true;
            }
        }

        state.last_payload = Some(payload);
        stats
    }

    /// Current generation, for scheduling a teardown after pruning.
    pub(super) fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}
