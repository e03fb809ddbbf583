//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.

use std::time::Duration;

use crate::infrastructure::exchange::connection::ConnectionConfig;
use crate::infrastructure::exchange::depth::DepthConfig;
use crate::infrastructure::exchange::reconnect::ReconnectConfig;
use crate::infrastructure::exchange::rest::{RestConfig, RetryConfig};
use crate::infrastructure::exchange::rpc::RpcClientConfig;
use crate::infrastructure::hub::HubConfig;
use crate::infrastructure::price_cache::PriceCacheConfig;
use crate::infrastructure::server::ClientConfig;

/// Exchange environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Exchange testnet.
    #[default]
    Testnet,
    /// Production exchange (real money).
    Mainnet,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "mainnet" | "live" | "production" => Self::Mainnet,
            _ => Self::Testnet,
        }
    }

    /// Check if this is the production environment.
    #[must_use]
    pub const fn is_mainnet(&self) -> bool {
        matches!(self, Self::Mainnet)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Testnet => "testnet",
            Self::Mainnet => "mainnet",
        }
    }
}

/// Exchange API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Shared token downstream clients present when connecting.
#[derive(Clone)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Compare against a presented token without short-circuiting on the
    /// first differing byte.
    #[must_use]
    pub fn matches(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Exchange endpoint URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Market data WebSocket.
    pub market_ws: String,
    /// Trading WebSocket API.
    pub trading_ws: String,
    /// REST API base.
    pub rest: String,
}

impl Endpoints {
    /// Default endpoints of an environment.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Mainnet => Self {
                market_ws: "wss://fstream.binance.com/ws".to_string(),
                trading_ws: "wss://ws-fapi.binance.com/ws-fapi/v1".to_string(),
                rest: "https://fapi.binance.com".to_string(),
            },
            Environment::Testnet => Self {
                market_ws: "wss://stream.binancefuture.com/ws".to_string(),
                trading_ws: "wss://testnet.binancefuture.com/ws-fapi/v1".to_string(),
                rest: "https://testnet.binancefuture.com".to_string(),
            },
        }
    }
}

/// Upstream WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence before considering the connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnection jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Maximum time a single write may take.
    pub write_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
    /// Inbound queue capacity per connection.
    pub inbound_capacity: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(120),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: 0, // Unlimited
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            inbound_capacity: 4096,
        }
    }
}

/// Fan-out and downstream client settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Delay between a room emptying and its teardown.
    pub grace_period: Duration,
    /// Payloads queued per client before updates are dropped.
    pub mailbox_capacity: usize,
    /// Maximum silence from a downstream client.
    pub read_deadline: Duration,
    /// Ping interval towards downstream clients.
    pub ping_interval: Duration,
    /// Maximum time a single downstream write may take.
    pub write_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            mailbox_capacity: 256,
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Order book feed settings.
#[derive(Debug, Clone)]
pub struct DepthSettings {
    /// Diffs held while waiting for a snapshot.
    pub ingest_capacity: usize,
    /// How long to wait for a bridging diff after a snapshot.
    pub bridge_timeout: Duration,
    /// Snapshots fetched per session before giving up.
    pub max_snapshot_attempts: u32,
    /// Diff stream update speed in milliseconds.
    pub update_speed_ms: u64,
}

impl Default for DepthSettings {
    fn default() -> Self {
        Self {
            ingest_capacity: 1000,
            bridge_timeout: Duration::from_secs(10),
            max_snapshot_attempts: 3,
            update_speed_ms: 100,
        }
    }
}

/// Trading channel settings.
#[derive(Debug, Clone)]
pub struct TradingSettings {
    /// RPC request deadline.
    pub request_timeout: Duration,
    /// REST request timeout.
    pub rest_timeout: Duration,
    /// REST read attempts including the first.
    pub rest_max_attempts: u32,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            rest_timeout: Duration::from_secs(10),
            rest_max_attempts: 3,
        }
    }
}

/// Price cache settings.
#[derive(Debug, Clone)]
pub struct PriceCacheSettings {
    /// Maximum age of a cached price.
    pub ttl: Duration,
    /// Maximum wait for a first price.
    pub wait_timeout: Duration,
    /// Poll cadence while waiting.
    pub poll_interval: Duration,
    /// Symbols subscribed at startup.
    pub symbols: Vec<String>,
}

impl Default for PriceCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            symbols: Vec::new(),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Downstream WebSocket port.
    pub gateway_port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            gateway_port: 8090,
            health_port: 8091,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Exchange environment.
    pub environment: Environment,
    /// Exchange endpoints.
    pub endpoints: Endpoints,
    /// API credentials.
    pub credentials: Credentials,
    /// Downstream connection token.
    pub auth_token: AuthToken,
    /// Server port settings.
    pub server: ServerSettings,
    /// Upstream WebSocket settings.
    pub websocket: WebSocketSettings,
    /// Fan-out settings.
    pub hub: HubSettings,
    /// Order book feed settings.
    pub depth: DepthSettings,
    /// Trading channel settings.
    pub trading: TradingSettings,
    /// Price cache settings.
    pub price_cache: PriceCacheSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let api_key = env.required("EXCHANGE_API_KEY")?;
        let api_secret = env.required("EXCHANGE_API_SECRET")?;
        let auth_token = env.required("GATEWAY_AUTH_TOKEN")?;

        let environment = env
            .get("GATEWAY_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let defaults = Endpoints::for_environment(environment);
        let endpoints = Endpoints {
            market_ws: env.get("EXCHANGE_MARKET_WS_URL").unwrap_or(defaults.market_ws),
            trading_ws: env.get("EXCHANGE_TRADING_WS_URL").unwrap_or(defaults.trading_ws),
            rest: env.get("EXCHANGE_REST_URL").unwrap_or(defaults.rest),
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            gateway_port: env.parse("GATEWAY_PORT", server_defaults.gateway_port),
            health_port: env.parse("GATEWAY_HEALTH_PORT", server_defaults.health_port),
        };

        let ws = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: env.secs("GATEWAY_HEARTBEAT_INTERVAL_SECS", ws.heartbeat_interval),
            heartbeat_timeout: env.secs("GATEWAY_HEARTBEAT_TIMEOUT_SECS", ws.heartbeat_timeout),
            reconnect_delay_initial: env.millis(
                "GATEWAY_RECONNECT_DELAY_INITIAL_MS",
                ws.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs("GATEWAY_RECONNECT_DELAY_MAX_SECS", ws.reconnect_delay_max),
            reconnect_delay_multiplier: env.parse(
                "GATEWAY_RECONNECT_DELAY_MULTIPLIER",
                ws.reconnect_delay_multiplier,
            ),
            reconnect_jitter: env.parse("GATEWAY_RECONNECT_JITTER", ws.reconnect_jitter),
            max_reconnect_attempts: env.parse("GATEWAY_MAX_RECONNECT_ATTEMPTS", ws.max_reconnect_attempts),
            connect_timeout: env.secs("GATEWAY_CONNECT_TIMEOUT_SECS", ws.connect_timeout),
            write_timeout: env.secs("GATEWAY_WRITE_TIMEOUT_SECS", ws.write_timeout),
            outbound_capacity: env.parse("GATEWAY_OUTBOUND_CAPACITY", ws.outbound_capacity),
            inbound_capacity: env.parse("GATEWAY_INBOUND_CAPACITY", ws.inbound_capacity),
        };

        let hub_defaults = HubSettings::default();
        let hub = HubSettings {
            grace_period: env.secs("GATEWAY_ROOM_GRACE_SECS", hub_defaults.grace_period),
            mailbox_capacity: env.parse("GATEWAY_CLIENT_MAILBOX_CAPACITY", hub_defaults.mailbox_capacity),
            read_deadline: env.secs("GATEWAY_CLIENT_READ_DEADLINE_SECS", hub_defaults.read_deadline),
            ping_interval: env.secs("GATEWAY_CLIENT_PING_INTERVAL_SECS", hub_defaults.ping_interval),
            write_timeout: env.secs("GATEWAY_CLIENT_WRITE_TIMEOUT_SECS", hub_defaults.write_timeout),
        };

        let depth_defaults = DepthSettings::default();
        let depth = DepthSettings {
            ingest_capacity: env.parse("GATEWAY_DEPTH_INGEST_CAPACITY", depth_defaults.ingest_capacity),
            bridge_timeout: env.secs("GATEWAY_DEPTH_BRIDGE_TIMEOUT_SECS", depth_defaults.bridge_timeout),
            max_snapshot_attempts: env.parse(
                "GATEWAY_DEPTH_MAX_SNAPSHOT_ATTEMPTS",
                depth_defaults.max_snapshot_attempts,
            ),
            update_speed_ms: env.parse("GATEWAY_DEPTH_UPDATE_SPEED_MS", depth_defaults.update_speed_ms),
        };

        let trading_defaults = TradingSettings::default();
        let trading = TradingSettings {
            request_timeout: env.secs("GATEWAY_RPC_TIMEOUT_SECS", trading_defaults.request_timeout),
            rest_timeout: env.secs("GATEWAY_REST_TIMEOUT_SECS", trading_defaults.rest_timeout),
            rest_max_attempts: env.parse("GATEWAY_REST_MAX_ATTEMPTS", trading_defaults.rest_max_attempts),
        };

        let cache_defaults = PriceCacheSettings::default();
        let price_cache = PriceCacheSettings {
            ttl: env.secs("GATEWAY_PRICE_TTL_SECS", cache_defaults.ttl),
            wait_timeout: env.secs("GATEWAY_PRICE_WAIT_SECS", cache_defaults.wait_timeout),
            poll_interval: env.millis("GATEWAY_PRICE_POLL_MS", cache_defaults.poll_interval),
            symbols: env.get("GATEWAY_PRICE_SYMBOLS").map_or(cache_defaults.symbols, |v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
        };

        Ok(Self {
            environment,
            endpoints,
            credentials: Credentials::new(api_key, api_secret),
            auth_token: AuthToken::new(auth_token),
            server,
            websocket,
            hub,
            depth,
            trading,
            price_cache,
        })
    }

    /// Market data connection limits.
    #[must_use]
    pub fn market_connection(&self) -> ConnectionConfig {
        ConnectionConfig::from_websocket_settings(&self.endpoints.market_ws, &self.websocket)
    }

    /// Upstream reconnect backoff.
    #[must_use]
    pub const fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig::from_websocket_settings(&self.websocket)
    }

    /// Hub configuration.
    #[must_use]
    pub const fn hub_config(&self) -> HubConfig {
        HubConfig {
            grace_period: self.hub.grace_period,
            reconnect: self.reconnect(),
        }
    }

    /// Downstream client limits.
    #[must_use]
    pub const fn client_config(&self) -> ClientConfig {
        ClientConfig {
            mailbox_capacity: self.hub.mailbox_capacity,
            read_deadline: self.hub.read_deadline,
            ping_interval: self.hub.ping_interval,
            write_timeout: self.hub.write_timeout,
        }
    }

    /// Depth feed tuning.
    #[must_use]
    pub const fn depth_config(&self) -> DepthConfig {
        DepthConfig {
            buffer_capacity: self.depth.ingest_capacity,
            bridge_timeout: self.depth.bridge_timeout,
            max_snapshot_attempts: self.depth.max_snapshot_attempts,
            update_speed_ms: self.depth.update_speed_ms,
        }
    }

    /// Trading RPC client configuration.
    #[must_use]
    pub fn rpc_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            connection: ConnectionConfig::from_websocket_settings(&self.endpoints.trading_ws, &self.websocket),
            request_timeout: self.trading.request_timeout,
            reconnect: self.reconnect(),
        }
    }

    /// REST client configuration.
    #[must_use]
    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.endpoints.rest.clone(),
            timeout: self.trading.rest_timeout,
            retry: RetryConfig {
                max_attempts: self.trading.rest_max_attempts.max(1),
                ..RetryConfig::default()
            },
        }
    }

    /// Price cache configuration.
    #[must_use]
    pub const fn price_cache_config(&self) -> PriceCacheConfig {
        PriceCacheConfig {
            ttl: self.price_cache.ttl,
            poll_interval: self.price_cache.poll_interval,
            wait_timeout: self.price_cache.wait_timeout,
            reconnect: self.reconnect(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

/// Typed reads over a variable source. Unparseable values fall back to the
/// default.
struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v),
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
