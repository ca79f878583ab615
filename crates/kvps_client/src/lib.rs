//! Shared key-value store with pub/sub (KVPS) adapter.
//!
//! Two independent logical connections back every node:
//! - [`KvpsClient`]: a multiplexed command connection used for all key
//!   operations and for publishing.
//! - [`KvpsSubscriber`]: a dedicated pub/sub connection driven by a
//!   background dispatch task that invokes per-channel callbacks.
//!
//! The split exists because pub/sub transports forbid mixing subscriptions
//! and regular commands on one connection. Subscription callbacks therefore
//! must route any publishes through the [`KvpsClient`] side.

pub mod client;
pub mod error;
pub mod subscriber;

pub use client::KvpsClient;
pub use error::{KvpsError, Result};
pub use subscriber::{KvpsSubscriber, MessageHandler};
