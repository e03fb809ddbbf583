//! Feed Supervision
//!
//! Runs a [`FeedSource`] session after session with exponential backoff
//! between failures. The backoff resets whenever a session reported a
//! successful connect, so a long healthy session followed by a drop retries
//! after the initial delay again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedSink, FeedSource};
use crate::domain::subscription::RoomKey;
use crate::infrastructure::exchange::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::feed_state::FeedState;
use crate::infrastructure::metrics::{self, FeedKind};

/// Wraps a sink to observe connects and messages of the current session.
struct SessionSink<P> {
    inner: Arc<dyn FeedSink<P>>,
    state: Arc<FeedState>,
    connected: AtomicBool,
}

impl<P: Send + Sync> FeedSink<P> for SessionSink<P> {
    fn publish(&self, payload: P) {
        self.state.record_message();
        self.inner.publish(payload);
    }

    fn connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.state.connected();
        }
        self.inner.connected();
    }
}

/// Run `feed` for `key` until `cancel` fires or the policy gives up.
pub async fn run_supervised<F>(
    feed: &F,
    key: &RoomKey,
    sink: Arc<dyn FeedSink<F::Payload>>,
    state: Arc<FeedState>,
    cancel: CancellationToken,
    reconnect: ReconnectConfig,
) where
    F: FeedSource + ?Sized,
{
    let mut policy = ReconnectPolicy::new(reconnect);
    let kind = FeedKind::from_name(feed.name());

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let session = Arc::new(SessionSink {
            inner: Arc::clone(&sink),
            state: Arc::clone(&state),
            connected: AtomicBool::new(false),
        });
        state.connecting();

        let session_sink: Arc<dyn FeedSink<F::Payload>> = session.clone();
        let result = feed.run(key, session_sink, cancel.clone()).await;
        let was_connected = session.connected.load(Ordering::SeqCst);

        match &result {
            Ok(()) => state.session_ended(was_connected, None),
            Err(e) => state.session_ended(was_connected, Some(e.to_string())),
        }

        if cancel.is_cancelled() {
            break;
        }
        if was_connected {
            policy.reset();
        }

        match result {
            Ok(()) => tracing::debug!(feed = feed.name(), room = %key, "Feed session ended"),
            Err(e) => tracing::warn!(
                feed = feed.name(),
                room = %key,
                error = %e,
                "Feed session failed"
            ),
        }

        let Some(delay) = policy.next_delay() else {
            tracing::error!(feed = feed.name(), room = %key, "Giving up on feed");
            break;
        };
        let attempt = policy.attempt_count();
        state.reconnecting(attempt);
        metrics::record_reconnect(kind);
        tracing::info!(
            feed = feed.name(),
            room = %key,
            attempt,
            delay_ms = delay.as_millis(),
            "Restarting feed"
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(feed = feed.name(), room = %key, "Feed supervisor stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::FeedError;

    #[derive(Default)]
    struct Recorder {
        payloads: Mutex<Vec<u32>>,
    }

    impl FeedSink<u32> for Recorder {
        fn publish(&self, payload: u32) {
            self.payloads.lock().push(payload);
        }

        fn connected(&self) {}
    }

    /// Fails `failures` times, then publishes one value and waits for cancel.
    struct FlakyFeed {
        failures: usize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl FeedSource for FlakyFeed {
        type Payload = u32;

        fn name(&self) -> &'static str {
            "mark_price"
        }

        async fn run(
            &self,
            _key: &RoomKey,
            sink: Arc<dyn FeedSink<u32>>,
            cancel: CancellationToken,
        ) -> Result<(), FeedError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                return Err(FeedError::Transport("refused".to_string()));
            }
            sink.connected();
            sink.publish(7);
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn retries_until_connected() {
        let feed = Arc::new(FlakyFeed {
            failures: 3,
            runs: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let state = Arc::new(FeedState::new("mark_price"));
        let cancel = CancellationToken::new();
        let key = RoomKey::price("BTCUSDT").unwrap();

        let task = {
            let feed = Arc::clone(&feed);
            let sink: Arc<dyn FeedSink<u32>> = recorder.clone();
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_supervised(
                    feed.as_ref(),
                    &key,
                    sink,
                    state,
                    cancel,
                    ReconnectConfig::immediate(Duration::from_millis(5)),
                )
                .await;
            })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.payloads.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(feed.runs.load(Ordering::SeqCst), 4);
        assert!(state.info().connected);
        assert_eq!(state.info().messages_received, 1);

        cancel.cancel();
        task.await.unwrap();
        assert!(!state.info().connected);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let feed = FlakyFeed {
            failures: usize::MAX,
            runs: AtomicUsize::new(0),
        };
        let sink: Arc<dyn FeedSink<u32>> = Arc::new(Recorder::default());
        let reconnect = ReconnectConfig {
            max_attempts: 2,
            ..ReconnectConfig::immediate(Duration::from_millis(1))
        };

        run_supervised(
            &feed,
            &RoomKey::price("BTCUSDT").unwrap(),
            sink,
            Arc::new(FeedState::new("mark_price")),
            CancellationToken::new(),
            reconnect,
        )
        .await;

        assert_eq!(feed.runs.load(Ordering::SeqCst), 3);
    }
}
