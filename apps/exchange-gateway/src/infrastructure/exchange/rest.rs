//! Exchange REST Client
//!
//! Depth snapshots for the order book feed and the signed trading API used
//! when the trading WebSocket fails.
//!
//! Signed requests put every parameter in the query string, sorted by key,
//! followed by `signature`. The API key travels in the `X-MBX-APIKEY`
//! header.
//!
//! Reads (`GET`) are retried on network errors and 5xx responses. Writes
//! are never retried here: the caller already fell back once.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::auth::{AuthError, Params, SIGNATURE_PARAM, Signer, TIMESTAMP_PARAM};
use super::commands::command_params;
use super::messages::{ExchangeErrorBody, PositionInfo};
use crate::application::ports::{FeedError, SnapshotSource, TradeChannel};
use crate::domain::order_book::DepthSnapshot;
use crate::domain::trading::TradeCommand;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Depth limits accepted by the snapshot endpoint.
pub const SNAPSHOT_LIMITS: [usize; 7] = [5, 10, 20, 50, 100, 500, 1000];

/// Smallest accepted snapshot limit covering `levels`.
#[must_use]
pub fn snapshot_limit(levels: usize) -> usize {
    SNAPSHOT_LIMITS
        .iter()
        .copied()
        .find(|&limit| limit >= levels)
        .unwrap_or(SNAPSHOT_LIMITS[SNAPSHOT_LIMITS.len() - 1])
}

// =============================================================================
// Error Type
// =============================================================================

/// REST failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestError {
    /// The request never got a response.
    #[error("network error: {0}")]
    Network(String),

    /// The exchange answered with an error body.
    #[error("exchange error {code}: {msg} (HTTP {status})")]
    Exchange {
        /// HTTP status.
        status: u16,
        /// Exchange error code.
        code: i64,
        /// Exchange message.
        msg: String,
    },

    /// Non-success status without a recognizable error body.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status.
        status: u16,
        /// Raw body.
        body: String,
    },

    /// Too many requests.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Suggested delay.
        retry_after_secs: u64,
    },

    /// The response body did not decode.
    #[error("JSON parsing error: {0}")]
    JsonParse(String),

    /// The request could not be signed.
    #[error("signing failed: {0}")]
    Signing(#[from] AuthError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy for idempotent reads.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Delay cap.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// REST client configuration.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL, e.g. `https://fapi.binance.com`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Read retries.
    pub retry: RetryConfig,
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the exchange REST API.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    signer: Signer,
    retry: RetryConfig,
}

impl RestClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Network`] if the HTTP client cannot be built.
    pub fn new(config: &RestConfig, signer: Signer) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RestError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signer,
            retry: config.retry.clone(),
        })
    }

    /// Fetch an order book snapshot of at least `levels` levels per side.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body does not decode.
    pub async fn depth_snapshot(&self, symbol: &str, levels: usize) -> Result<DepthSnapshot, RestError> {
        let query = format!("symbol={symbol}&limit={}", snapshot_limit(levels));
        let value = self.request(Method::GET, "/fapi/v1/depth", &query, false).await?;
        decode(value)
    }

    /// Positions, optionally for one symbol.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body does not decode.
    pub async fn positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>, RestError> {
        let command = TradeCommand::QueryPosition {
            symbol: symbol.map(str::to_string),
        };
        decode(self.execute_command(&command).await?)
    }

    /// Execute one trade command over the signed REST API.
    ///
    /// # Errors
    ///
    /// Returns an error if signing or the request fails.
    pub async fn execute_command(&self, command: &TradeCommand) -> Result<Value, RestError> {
        let (method, path) = route(command);
        let query = self.signed_query(command_params(command), Utc::now().timestamp_millis())?;
        self.request(method, path, &query, true).await
    }

    /// Sorted query string with `timestamp` and a trailing `signature`.
    fn signed_query(&self, mut params: Params, timestamp_ms: i64) -> Result<String, RestError> {
        params.set(TIMESTAMP_PARAM, timestamp_ms);
        let signature = self.signer.sign(&params)?;
        Ok(format!(
            "{}&{SIGNATURE_PARAM}={signature}",
            params.canonical_query()?
        ))
    }

    async fn request(&self, method: Method, path: &str, query: &str, signed: bool) -> Result<Value, RestError> {
        let url = format!("{}{path}?{query}", self.base_url);
        let mut attempt = 1;
        let mut backoff = self.retry.initial_backoff;

        loop {
            let mut request = self.client.request(method.clone(), &url);
            if signed {
                request = request.header(API_KEY_HEADER, self.signer.api_key());
            }

            let result = match request.send().await {
                Ok(response) => read_response(response).await,
                Err(e) => Err(RestError::Network(e.to_string())),
            };

            let retryable = method == Method::GET
                && matches!(
                    &result,
                    Err(RestError::Network(_)) | Err(RestError::Http { status: 500..=599, .. })
                );
            if !retryable || attempt >= self.retry.max_attempts {
                return result;
            }

            if let Err(e) = &result {
                tracing::warn!(
                    path,
                    error = %e,
                    attempt,
                    delay_ms = backoff.as_millis(),
                    "REST read failed, retrying"
                );
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.retry.max_backoff);
            attempt += 1;
        }
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value, RestError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response
        .text()
        .await
        .map_err(|e| RestError::Network(e.to_string()))?;

    if status.is_success() {
        if body.is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&body).map_err(|e| RestError::JsonParse(e.to_string()));
    }

    if matches!(status, StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT) {
        return Err(RestError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        });
    }

    match serde_json::from_str::<ExchangeErrorBody>(&body) {
        Ok(err) => Err(RestError::Exchange {
            status: status.as_u16(),
            code: err.code,
            msg: err.msg,
        }),
        Err(_) => Err(RestError::Http {
            status: status.as_u16(),
            body,
        }),
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RestError> {
    serde_json::from_value(value).map_err(|e| RestError::JsonParse(e.to_string()))
}

/// HTTP method and path executing `command`.
#[must_use]
pub fn route(command: &TradeCommand) -> (Method, &'static str) {
    match command {
        TradeCommand::PlaceOrder(_) => (Method::POST, "/fapi/v1/order"),
        TradeCommand::ModifyOrder(_) => (Method::PUT, "/fapi/v1/order"),
        TradeCommand::CancelOrder { .. } => (Method::DELETE, "/fapi/v1/order"),
        TradeCommand::OrderStatus { .. } => (Method::GET, "/fapi/v1/order"),
        TradeCommand::PlaceAlgoOrder(_) => (Method::POST, "/sapi/v1/algo/futures/newOrderTwap"),
        TradeCommand::CancelAlgoOrder { .. } => (Method::DELETE, "/sapi/v1/algo/futures/order"),
        TradeCommand::QueryPosition { .. } => (Method::GET, "/fapi/v2/positionRisk"),
        TradeCommand::SetLeverage { .. } => (Method::POST, "/fapi/v1/leverage"),
    }
}

#[async_trait]
impl SnapshotSource for RestClient {
    async fn fetch_snapshot(&self, symbol: &str, levels: usize) -> Result<DepthSnapshot, FeedError> {
        self.depth_snapshot(symbol, levels)
            .await
            .map_err(|e| FeedError::Snapshot(e.to_string()))
    }
}

#[async_trait]
impl TradeChannel for RestClient {
    type Error = RestError;

    fn name(&self) -> &'static str {
        "rest"
    }

    async fn execute(&self, command: &TradeCommand) -> Result<Value, RestError> {
        self.execute_command(command).await
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::config::Credentials;

    #[test_case(1 => 5)]
    #[test_case(5 => 5)]
    #[test_case(6 => 10)]
    #[test_case(20 => 20)]
    #[test_case(21 => 50)]
    #[test_case(101 => 500)]
    #[test_case(1000 => 1000)]
    #[test_case(5000 => 1000)]
    fn snapshot_limits(levels: usize) -> usize {
        snapshot_limit(levels)
    }

    #[test]
    fn signed_query_is_sorted_with_trailing_signature() {
        let signer = Signer::new(Credentials::new("key".to_string(), "secret".to_string()));
        let client = RestClient::new(
            &RestConfig {
                base_url: "http://localhost/".to_string(),
                timeout: Duration::from_secs(1),
                retry: RetryConfig::default(),
            },
            signer.clone(),
        )
        .unwrap();

        let params = Params::new().with("symbol", "BTCUSDT").with("leverage", 5_u32);
        let query = client.signed_query(params.clone(), 1_700_000_000_000).unwrap();

        let expected = params.with(TIMESTAMP_PARAM, 1_700_000_000_000_i64);
        let signature = signer.sign(&expected).unwrap();
        assert_eq!(
            query,
            format!("leverage=5&symbol=BTCUSDT&timestamp=1700000000000&signature={signature}")
        );
        assert_eq!(client.base_url, "http://localhost");
    }

    #[test]
    fn routes() {
        let (method, path) = route(&TradeCommand::CancelAlgoOrder { algo_id: 3 });
        assert_eq!(method, Method::DELETE);
        assert_eq!(path, "/sapi/v1/algo/futures/order");
    }
}
