//! Exchange Adapters
//!
//! Clients for the derivatives exchange:
//!
//! - **Market stream**: mark price and diff depth feeds (JSON over WebSocket)
//! - **Trading API**: correlated, signed RPC over a persistent WebSocket
//! - **REST**: depth snapshots and the signed trading fallback

pub mod auth;
pub mod codec;
pub mod commands;
pub mod connection;
pub mod depth;
pub mod heartbeat;
pub mod mark_price;
pub mod messages;
pub mod reconnect;
pub mod rest;
pub mod rpc;
pub mod stream;

pub use auth::{AuthError, Params, Signer};
pub use codec::{CodecError, MarketMessage, decode_market};
pub use connection::{Connection, ConnectionConfig, ConnectionWriter, TransportError};
pub use depth::{DepthConfig, DepthFeed};
pub use heartbeat::{HeartbeatConfig, Liveness};
pub use mark_price::MarkPriceFeed;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rest::{RestClient, RestConfig, RestError, RetryConfig};
pub use rpc::{ExecutionRpcClient, RpcClientConfig, RpcError, RpcMethod};
