//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for feeds, snapshots and trade channels.
pub mod ports;

/// Application services for trade execution.
pub mod services;
