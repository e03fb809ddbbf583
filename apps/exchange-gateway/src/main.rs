//! Exchange Gateway Binary
//!
//! Starts the market data fan-out, the price cache and the trading channels.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin exchange-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `EXCHANGE_API_KEY`: Exchange API key
//! - `EXCHANGE_API_SECRET`: Exchange API secret
//! - `GATEWAY_AUTH_TOKEN`: Token downstream clients must present
//!
//! ## Optional
//! - `GATEWAY_ENV`: testnet | mainnet (default: testnet)
//! - `EXCHANGE_MARKET_WS_URL`, `EXCHANGE_TRADING_WS_URL`, `EXCHANGE_REST_URL`: Endpoint overrides
//! - `GATEWAY_PORT`: Downstream WebSocket port (default: 8090)
//! - `GATEWAY_HEALTH_PORT`: Health check and metrics port (default: 8091)
//! - `GATEWAY_PRICE_SYMBOLS`: Comma separated symbols to keep in the price cache
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use exchange_gateway::infrastructure::exchange::{
    DepthFeed, ExecutionRpcClient, MarkPriceFeed, RestClient, Signer,
};
use exchange_gateway::infrastructure::health::{FeedStates, HealthServer, HealthServerState};
use exchange_gateway::infrastructure::hub::SubscriptionHub;
use exchange_gateway::infrastructure::price_cache::PriceCache;
use exchange_gateway::infrastructure::server::{GatewayServer, ServerState};
use exchange_gateway::infrastructure::telemetry;
use exchange_gateway::{GatewayConfig, TradeCommand, TradeExecutor, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time allowed for tasks to observe cancellation before exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting exchange gateway");

    let _metrics_handle = init_metrics()?;

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let signer = Signer::new(config.credentials.clone());

    // REST serves snapshots and the trading fallback
    let rest = Arc::new(RestClient::new(&config.rest_config(), signer.clone())?);

    // Fan-out hubs
    let price_feed = Arc::new(MarkPriceFeed::new(config.market_connection()));
    let price_hub = SubscriptionHub::new(Arc::clone(&price_feed), config.hub_config(), &shutdown_token);

    let depth_feed = Arc::new(DepthFeed::new(
        config.market_connection(),
        Arc::clone(&rest),
        config.depth_config(),
    ));
    let book_hub = SubscriptionHub::new(depth_feed, config.hub_config(), &shutdown_token);

    // Price cache
    let price_cache = PriceCache::new(price_feed, config.price_cache_config(), &shutdown_token);
    for symbol in &config.price_cache.symbols {
        if let Err(e) = price_cache.subscribe(symbol) {
            tracing::warn!(symbol, error = %e, "Skipping price cache symbol");
        }
    }

    // Trading channels
    let rpc = Arc::new(ExecutionRpcClient::new(config.rpc_config(), signer, &shutdown_token));
    if let Err(e) = rpc.connect().await {
        tracing::warn!(error = %e, "Trading connection unavailable, reconnecting in background");
        rpc.trigger_reconnect();
    }
    let executor = TradeExecutor::new(Arc::clone(&rpc), Arc::clone(&rest));
    check_trading_access(&executor).await;

    // Downstream server
    let server_state = Arc::new(ServerState::new(
        Arc::new(price_hub.clone()),
        Arc::new(book_hub.clone()),
        config.client_config(),
        config.auth_token.clone(),
        &shutdown_token,
    ));
    let gateway_addr = SocketAddr::from(([0, 0, 0, 0], config.server.gateway_port));
    let gateway_server = GatewayServer::new(gateway_addr, Arc::clone(&server_state), shutdown_token.clone());

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        FeedStates {
            mark_price: price_hub.feed_state(),
            price_cache: price_cache.feed_state(),
            depth: book_hub.feed_state(),
            trading: rpc.feed_state(),
        },
        server_state,
    ));
    let health_server = HealthServer::new(config.server.health_port, health_state, shutdown_token.clone());

    let gateway_task = tokio::spawn(async move {
        if let Err(e) = gateway_server.run().await {
            tracing::error!(error = %e, "Gateway server error");
        }
    });
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Exchange gateway ready");

    await_shutdown(shutdown_token).await;

    price_hub.shutdown();
    book_hub.shutdown();
    price_cache.shutdown();
    rpc.shutdown();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = gateway_task.await;
        let _ = health_task.await;
    })
    .await
    .is_err()
    {
        tracing::warn!("Servers did not stop in time");
    }

    tracing::info!("Exchange gateway stopped");
    Ok(())
}

/// Query positions once so bad credentials show up at startup.
async fn check_trading_access(executor: &TradeExecutor<ExecutionRpcClient, RestClient>) {
    match executor.execute(&TradeCommand::QueryPosition { symbol: None }).await {
        Ok(execution) => {
            let positions = execution.result.as_array().map_or(0, Vec::len);
            tracing::info!(route = ?execution.route, positions, "Trading access verified");
        }
        Err(e) => tracing::warn!(error = %e, "Trading access check failed"),
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        gateway_port = config.server.gateway_port,
        health_port = config.server.health_port,
        price_symbols = config.price_cache.symbols.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        market_ws = %config.endpoints.market_ws,
        trading_ws = %config.endpoints.trading_ws,
        rest = %config.endpoints.rest,
        "Exchange endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
