//! Domain Layer - Core market state types and business logic.
//!
//! This layer contains the order book replica, the downstream payload types
//! and the subscription model. Nothing here performs I/O.

/// Local order book replica and its synchronizer.
pub mod order_book;

/// Downstream payload types (mark prices, book views).
pub mod streaming;

/// Room keys, client protocol and subscription tracking.
pub mod subscription;

/// Typed trade commands.
pub mod trading;
