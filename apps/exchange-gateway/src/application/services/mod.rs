//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `TradeExecutor`: Sends trade commands over the primary channel and falls
//!   back to the secondary channel for that call when the primary fails

use std::sync::Arc;

use serde_json::Value;

use crate::application::ports::{Reconnectable, TradeChannel};
use crate::domain::trading::TradeCommand;
use crate::infrastructure::metrics;

/// Which channel produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionRoute {
    /// The persistent trading connection.
    Primary,
    /// The per-call fallback.
    Fallback,
}

/// Result of an executed command.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Channel that answered.
    pub route: ExecutionRoute,
    /// Exchange result payload.
    pub result: Value,
}

/// Primary-then-fallback trade execution.
///
/// A primary failure is never returned to the caller. It is logged and the
/// same command is sent once over the fallback. When the failure means the
/// primary's connection is gone, it is also asked to reconnect in the
/// background.
pub struct TradeExecutor<P, F> {
    primary: Arc<P>,
    fallback: Arc<F>,
}

impl<P, F> TradeExecutor<P, F>
where
    P: TradeChannel + Reconnectable,
    F: TradeChannel,
{
    /// Create an executor.
    #[must_use]
    pub const fn new(primary: Arc<P>, fallback: Arc<F>) -> Self {
        Self { primary, fallback }
    }

    /// Execute a command.
    ///
    /// # Errors
    ///
    /// Returns the fallback's error when both channels fail.
    pub async fn execute(&self, command: &TradeCommand) -> Result<Execution, F::Error> {
        match self.primary.execute(command).await {
            Ok(result) => Ok(Execution {
                route: ExecutionRoute::Primary,
                result,
            }),
            Err(err) => {
                tracing::warn!(
                    command = command.kind(),
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %err,
                    "Primary trade channel failed, using fallback"
                );
                if self.primary.is_connection_failure(&err) {
                    self.primary.trigger_reconnect();
                }
                metrics::record_trade_fallback(command.kind());

                let result = self.fallback.execute(command).await.inspect_err(|e| {
                    tracing::error!(
                        command = command.kind(),
                        fallback = self.fallback.name(),
                        error = %e,
                        "Fallback trade channel failed"
                    );
                })?;

                Ok(Execution {
                    route: ExecutionRoute::Fallback,
                    result,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::trading::{OrderRequest, OrderSide};

    #[derive(Debug, Clone, Copy, thiserror::Error)]
    enum FakeError {
        #[error("connection lost")]
        Disconnected,
        #[error("rejected")]
        Rejected,
    }

    #[derive(Default)]
    struct FakeChannel {
        fail: Option<FakeError>,
        calls: AtomicUsize,
        reconnects: AtomicUsize,
    }

    impl FakeChannel {
        fn failing() -> Self {
            Self::failing_with(FakeError::Disconnected)
        }

        fn failing_with(error: FakeError) -> Self {
            Self {
                fail: Some(error),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TradeChannel for FakeChannel {
        type Error = FakeError;

        fn name(&self) -> &'static str {
            "fake"
        }

        async fn execute(&self, command: &TradeCommand) -> Result<Value, FakeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                Some(error) => Err(error),
                None => Ok(serde_json::json!({ "kind": command.kind() })),
            }
        }
    }

    impl Reconnectable for FakeChannel {
        fn is_connection_failure(&self, error: &FakeError) -> bool {
            matches!(error, FakeError::Disconnected)
        }

        fn trigger_reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn command() -> TradeCommand {
        TradeCommand::PlaceOrder(OrderRequest::market("BTCUSDT", OrderSide::Buy, Decimal::ONE))
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let primary = Arc::new(FakeChannel::default());
        let fallback = Arc::new(FakeChannel::default());
        let executor = TradeExecutor::new(Arc::clone(&primary), Arc::clone(&fallback));

        let execution = executor.execute(&command()).await.unwrap();

        assert_eq!(execution.route, ExecutionRoute::Primary);
        assert_eq!(execution.result["kind"], "place_order");
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
        assert_eq!(primary.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_and_triggers_reconnect() {
        let primary = Arc::new(FakeChannel::failing());
        let fallback = Arc::new(FakeChannel::default());
        let executor = TradeExecutor::new(Arc::clone(&primary), Arc::clone(&fallback));

        let execution = executor.execute(&command()).await.unwrap();

        assert_eq!(execution.route, ExecutionRoute::Fallback);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(primary.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejection_falls_back_without_reconnect() {
        let primary = Arc::new(FakeChannel::failing_with(FakeError::Rejected));
        let fallback = Arc::new(FakeChannel::default());
        let executor = TradeExecutor::new(Arc::clone(&primary), Arc::clone(&fallback));

        let execution = executor.execute(&command()).await.unwrap();

        assert_eq!(execution.route, ExecutionRoute::Fallback);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(primary.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn both_failing_returns_fallback_error() {
        let executor = TradeExecutor::new(
            Arc::new(FakeChannel::failing()),
            Arc::new(FakeChannel::failing()),
        );
        assert!(executor.execute(&command()).await.is_err());
    }
}
