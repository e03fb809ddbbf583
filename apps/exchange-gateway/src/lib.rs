#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Exchange Gateway - Real-Time Transport Layer
//!
//! Keeps persistent WebSocket connections to a derivatives exchange, maintains
//! synchronized order book replicas, fans market data out to internal
//! consumers and executes signed trade commands over a correlated RPC
//! channel with a REST fallback.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Order book replica, payloads, subscriptions, trade commands
//!   - `order_book`: Replica plus snapshot/diff synchronizer
//!   - `streaming`: Mark price and book view payloads
//!   - `subscription`: Room keys and the client protocol
//!   - `trading`: Typed trade commands
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Feed sources, snapshot sources, trade channels
//!   - `services`: Primary-then-fallback trade execution
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: Market streams, trading RPC, REST
//!   - `hub`: Per-key fan-out rooms with supervised feeds
//!   - `price_cache`: Latest mark price per symbol
//!   - `server`: Downstream WebSocket endpoints
//!   - `config`, `health`, `metrics`, `telemetry`: Ambient concerns
//!
//! # Data Flow
//!
//! ```text
//! markPrice WS ──► MarkPriceFeed ──► price rooms ──► /ws/price clients
//!              └─► PriceCache ──► get(symbol)
//! depth WS + REST snapshot ──► DepthFeed ──► book rooms ──► /ws/orderbook clients
//! TradeExecutor ──► ExecutionRpcClient (trading WS) ──fallback──► RestClient
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market state types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::order_book::{
    BookError, DepthSnapshot, DiffEvent, LocalOrderBook, OrderBookLevel, OrderBookSynchronizer,
    SyncError, SyncState,
};
pub use domain::streaming::{BookUpdate, MarkPrice};
pub use domain::subscription::{ClientRequest, RoomKey, ServerNotice, SubscriptionError};
pub use domain::trading::TradeCommand;

// Application
pub use application::ports::{FeedError, FeedSink, FeedSource, SnapshotSource, TradeChannel};
pub use application::services::{Execution, ExecutionRoute, TradeExecutor};

// Infrastructure config
pub use infrastructure::config::{
    AuthToken, ConfigError, Credentials, Environment, GatewayConfig, WebSocketSettings,
};

// Exchange clients
pub use infrastructure::exchange::{
    DepthFeed, ExecutionRpcClient, MarkPriceFeed, RestClient, RestError, RpcError, Signer,
};

// Fan-out and cache
pub use infrastructure::hub::{HubConfig, HubError, SubscriptionHub};
pub use infrastructure::price_cache::{PriceCache, PriceCacheConfig, PriceCacheError};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::server::{GatewayServer, ServerError, ServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
