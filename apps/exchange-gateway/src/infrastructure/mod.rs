//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration loading.
pub mod config;

/// Exchange adapters (market streams, trading RPC, REST).
pub mod exchange;

/// Per-feed connection state.
pub mod feed_state;

/// Health check HTTP endpoint.
pub mod health;

/// Fan-out rooms over upstream feeds.
pub mod hub;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Mark price cache for synchronous lookups.
pub mod price_cache;

/// Downstream WebSocket server.
pub mod server;

/// Logging and OpenTelemetry trace export.
pub mod telemetry;
