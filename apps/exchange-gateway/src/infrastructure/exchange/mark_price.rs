//! Mark Price Feed
//!
//! One upstream `<symbol>@markPrice@1s` stream per price room.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::codec::{MarketMessage, decode_market};
use super::connection::ConnectionConfig;
use super::messages::mark_price_stream;
use super::stream::open_market_stream;
use crate::application::ports::{FeedError, FeedSink, FeedSource};
use crate::domain::streaming::MarkPrice;
use crate::domain::subscription::RoomKey;
use crate::infrastructure::metrics::{self, FeedKind};

/// Mark price feed over the market data stream.
#[derive(Debug, Clone)]
pub struct MarkPriceFeed {
    connection: ConnectionConfig,
}

impl MarkPriceFeed {
    /// Create a feed connecting with `connection`.
    #[must_use]
    pub const fn new(connection: ConnectionConfig) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl FeedSource for MarkPriceFeed {
    type Payload = MarkPrice;

    fn name(&self) -> &'static str {
        FeedKind::MarkPrice.as_str()
    }

    async fn run(
        &self,
        key: &RoomKey,
        sink: Arc<dyn FeedSink<MarkPrice>>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        if key.levels().is_some() {
            return Err(FeedError::UnsupportedKey(key.to_string()));
        }
        let symbol = key.symbol();

        let mut connection =
            open_market_stream(&self.connection, vec![mark_price_stream(symbol)], &cancel).await?;
        sink.connected();
        tracing::info!(symbol, "Mark price stream connected");

        loop {
            let text = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                frame = connection.recv() => frame?,
            };
            metrics::record_upstream_message(FeedKind::MarkPrice);

            match decode_market(&text) {
                Ok(MarketMessage::MarkPrice(msg)) if msg.symbol.eq_ignore_ascii_case(symbol) => {
                    sink.publish(msg.into());
                }
                Ok(MarketMessage::Error(err)) => {
                    return Err(FeedError::Exchange {
                        code: err.error.code,
                        msg: err.error.msg,
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(symbol, error = %e, "Undecodable mark price frame"),
            }
        }
    }
}
