//! Order Book Depth Feed
//!
//! Drives an [`OrderBookSynchronizer`] from the diff depth stream and a REST
//! snapshot, and publishes the truncated book after every change.
//!
//! # Session flow
//!
//! 1. Subscribe to the diff stream; diffs are buffered from the first frame.
//! 2. Fetch the snapshot while buffering continues.
//! 3. Replay the buffer. If no event bridges the snapshot within the bridge
//!    timeout, or the snapshot is stale, fetch another one.
//! 4. Once synced, apply diffs in order and publish.
//!
//! Any continuity failure ends the session; the supervisor starts a fresh one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::codec::{MarketMessage, decode_market};
use super::connection::{Connection, ConnectionConfig};
use super::messages::depth_stream;
use super::stream::open_market_stream;
use crate::application::ports::{FeedError, FeedSink, FeedSource, SnapshotSource};
use crate::domain::order_book::{DiffEvent, OrderBookSynchronizer, SyncError, SyncState};
use crate::domain::streaming::BookUpdate;
use crate::domain::subscription::{DEFAULT_BOOK_LEVELS, RoomKey};
use crate::infrastructure::metrics::{self, FeedKind};

/// Depth feed tuning.
#[derive(Debug, Clone)]
pub struct DepthConfig {
    /// Diffs held while waiting for a snapshot.
    pub buffer_capacity: usize,
    /// How long to wait for a bridging diff after a snapshot.
    pub bridge_timeout: Duration,
    /// Snapshots fetched per session before giving up.
    pub max_snapshot_attempts: u32,
    /// Diff stream update speed in milliseconds (100, 250 or 500).
    pub update_speed_ms: u64,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            bridge_timeout: Duration::from_secs(10),
            max_snapshot_attempts: 3,
            update_speed_ms: 100,
        }
    }
}

/// Order book feed.
pub struct DepthFeed<S> {
    connection: ConnectionConfig,
    snapshots: Arc<S>,
    config: DepthConfig,
}

impl<S: SnapshotSource> DepthFeed<S> {
    /// Create a feed fetching snapshots from `snapshots`.
    #[must_use]
    pub const fn new(connection: ConnectionConfig, snapshots: Arc<S>, config: DepthConfig) -> Self {
        Self {
            connection,
            snapshots,
            config,
        }
    }
}

type BookSink = Arc<dyn FeedSink<Arc<BookUpdate>>>;

/// One synchronized session.
struct Session<'a> {
    symbol: &'a str,
    levels: usize,
    sync: OrderBookSynchronizer,
    sink: &'a BookSink,
}

impl Session<'_> {
    /// Feed one frame. Returns an error when the session must restart.
    fn on_frame(&mut self, text: &str) -> Result<(), FeedError> {
        metrics::record_upstream_message(FeedKind::Depth);

        let event: DiffEvent = match decode_market(text) {
            Ok(MarketMessage::Depth(msg)) if msg.symbol.eq_ignore_ascii_case(self.symbol) => {
                msg.into()
            }
            Ok(MarketMessage::Error(err)) => {
                return Err(FeedError::Exchange {
                    code: err.error.code,
                    msg: err.error.msg,
                });
            }
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::warn!(symbol = self.symbol, error = %e, "Undecodable depth frame");
                return Ok(());
            }
        };

        match self.sync.ingest(event) {
            Ok(progress) => {
                if progress.changed_book() {
                    self.publish();
                }
                Ok(())
            }
            // The bootstrap loop refetches.
            Err(SyncError::StaleSnapshot { .. }) => {
                metrics::record_resync("stale_snapshot");
                Ok(())
            }
            Err(err) => Err(self.desync(err)),
        }
    }

    fn publish(&self) {
        let (SyncState::Synced, Some(book)) = (self.sync.state(), self.sync.book()) else {
            return;
        };
        self.sink.publish(Arc::new(BookUpdate::from_book(
            book,
            self.levels,
            self.sync.last_event_time().unwrap_or_default(),
        )));
    }

    fn desync(&self, err: SyncError) -> FeedError {
        let reason = match &err {
            SyncError::BufferOverflow { .. } => "overflow",
            SyncError::Book(_) => "gap",
            SyncError::StaleSnapshot { .. } => "stale_snapshot",
            SyncError::UnexpectedInput { .. } => "unexpected",
        };
        metrics::record_resync(reason);
        tracing::warn!(symbol = self.symbol, reason, error = %err, "Order book desync");
        FeedError::Desync(err)
    }
}

impl<S: SnapshotSource> DepthFeed<S> {
    /// Buffer diffs until a snapshot is fetched, then until it bridges.
    async fn bootstrap(
        &self,
        session: &mut Session<'_>,
        connection: &mut Connection,
        cancel: &CancellationToken,
    ) -> Result<bool, FeedError> {
        let mut attempts = 0;

        while session.sync.state() != SyncState::Synced {
            attempts += 1;
            if attempts > self.config.max_snapshot_attempts {
                return Err(FeedError::Snapshot(format!(
                    "no bridging snapshot after {} attempts",
                    self.config.max_snapshot_attempts
                )));
            }

            let fetch = self.snapshots.fetch_snapshot(session.symbol, session.levels);
            tokio::pin!(fetch);
            let snapshot = loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(false),
                    result = &mut fetch => break result?,
                    frame = connection.recv() => session.on_frame(&frame?)?,
                }
            };

            tracing::debug!(
                symbol = session.symbol,
                snapshot_id = snapshot.last_update_id,
                buffered = session.sync.buffered(),
                attempt = attempts,
                "Snapshot fetched"
            );

            match session.sync.on_snapshot(&snapshot) {
                Ok(SyncState::Synced) => {
                    session.publish();
                    break;
                }
                Ok(_) => {}
                Err(SyncError::StaleSnapshot { .. }) => {
                    metrics::record_resync("stale_snapshot");
                    tracing::info!(symbol = session.symbol, "Snapshot is stale, refetching");
                    continue;
                }
                Err(err) => return Err(session.desync(err)),
            }

            let deadline = tokio::time::sleep(self.config.bridge_timeout);
            tokio::pin!(deadline);
            while session.sync.state() == SyncState::AwaitingBridge {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(false),
                    () = &mut deadline => {
                        session.sync.on_bridge_timeout();
                        metrics::record_resync("bridge_timeout");
                        tracing::info!(symbol = session.symbol, "No bridging diff, refetching snapshot");
                    }
                    frame = connection.recv() => session.on_frame(&frame?)?,
                }
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl<S: SnapshotSource> FeedSource for DepthFeed<S> {
    type Payload = Arc<BookUpdate>;

    fn name(&self) -> &'static str {
        FeedKind::Depth.as_str()
    }

    async fn run(
        &self,
        key: &RoomKey,
        sink: BookSink,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let symbol = key.symbol();
        let levels = key.levels().unwrap_or(DEFAULT_BOOK_LEVELS);

        let stream = depth_stream(symbol, self.config.update_speed_ms);
        let mut connection = open_market_stream(&self.connection, vec![stream], &cancel).await?;
        sink.connected();

        let mut session = Session {
            symbol,
            levels,
            sync: OrderBookSynchronizer::new(symbol, self.config.buffer_capacity),
            sink: &sink,
        };
        session.sync.begin();

        if !self.bootstrap(&mut session, &mut connection, &cancel).await? {
            return Ok(());
        }
        tracing::info!(
            symbol,
            levels,
            last_update_id = session.sync.book().map(|b| b.last_update_id()),
            "Order book synced"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                frame = connection.recv() => session.on_frame(&frame?)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::domain::order_book::{DepthSnapshot, OrderBookLevel};

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Arc<BookUpdate>>>,
    }

    impl FeedSink<Arc<BookUpdate>> for Recorder {
        fn publish(&self, payload: Arc<BookUpdate>) {
            self.updates.lock().push(payload);
        }

        fn connected(&self) {}
    }

    fn depth_frame(first: u64, last: u64, prev: u64, bid: (&str, &str)) -> String {
        serde_json::json!({
            "e": "depthUpdate", "E": 1_700_000_000_000_i64 + i64::try_from(last).unwrap(),
            "s": "BTCUSDT", "U": first, "u": last, "pu": prev,
            "b": [[bid.0, bid.1]], "a": []
        })
        .to_string()
    }

    fn session(sink: &BookSink) -> Session<'_> {
        let mut sync = OrderBookSynchronizer::new("BTCUSDT", 4);
        sync.begin();
        Session {
            symbol: "BTCUSDT",
            levels: 5,
            sync,
            sink,
        }
    }

    #[test]
    fn publishes_after_bridge_and_steady_diffs() {
        let recorder = Arc::new(Recorder::default());
        let sink: BookSink = recorder.clone();
        let mut session = session(&sink);

        session.on_frame(&depth_frame(99, 105, 98, ("50001", "2"))).unwrap();
        assert!(recorder.updates.lock().is_empty());

        let snapshot = DepthSnapshot {
            last_update_id: 100,
            bids: vec![OrderBookLevel::new("50000", "1")],
            asks: vec![OrderBookLevel::new("50010", "1")],
        };
        assert_eq!(session.sync.on_snapshot(&snapshot).unwrap(), SyncState::Synced);
        session.publish();

        session.on_frame(&depth_frame(106, 107, 105, ("50000", "0"))).unwrap();

        let updates = recorder.updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].bids.len(), 2);
        assert_eq!(updates[0].event_time, 1_700_000_000_105);
        assert_eq!(updates[1].bids, vec![OrderBookLevel::new("50001", "2")]);
        assert_eq!(updates[1].event_time, 1_700_000_000_107);
    }

    #[test]
    fn gap_ends_session() {
        let recorder = Arc::new(Recorder::default());
        let sink: BookSink = recorder.clone();
        let mut session = session(&sink);
        session.sync.on_snapshot(&DepthSnapshot {
            last_update_id: 100,
            bids: vec![],
            asks: vec![],
        })
        .unwrap();
        session.on_frame(&depth_frame(99, 105, 98, ("1", "1"))).unwrap();

        let err = session
            .on_frame(&depth_frame(110, 111, 104, ("1", "2")))
            .unwrap_err();
        assert!(matches!(err, FeedError::Desync(SyncError::Book(_))));
        assert_eq!(session.sync.state(), SyncState::Disconnected);
    }

    #[test]
    fn overflow_before_snapshot_ends_session() {
        let sink: BookSink = Arc::new(Recorder::default());
        let mut session = session(&sink);
        for i in 0..4 {
            session.on_frame(&depth_frame(i, i + 1, i, ("1", "1"))).unwrap();
        }
        let err = session.on_frame(&depth_frame(5, 6, 5, ("1", "1"))).unwrap_err();
        assert!(matches!(
            err,
            FeedError::Desync(SyncError::BufferOverflow { capacity: 4 })
        ));
    }

    #[test]
    fn other_symbols_and_events_are_ignored() {
        let sink: BookSink = Arc::new(Recorder::default());
        let mut session = session(&sink);
        session
            .on_frame(r#"{"e":"depthUpdate","E":1,"s":"ETHUSDT","U":1,"u":2,"pu":0,"b":[],"a":[]}"#)
            .unwrap();
        session.on_frame(r#"{"result":null,"id":1}"#).unwrap();
        session.on_frame("not json").unwrap();
        assert_eq!(session.sync.buffered(), 0);
    }
}
