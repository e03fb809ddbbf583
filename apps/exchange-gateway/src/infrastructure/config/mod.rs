//! Configuration Module
//!
//! Configuration loading for the gateway service.

mod settings;

pub use settings::{
    AuthToken, ConfigError, Credentials, DepthSettings, Endpoints, Environment, GatewayConfig,
    HubSettings, PriceCacheSettings, ServerSettings, TradingSettings, WebSocketSettings,
};
