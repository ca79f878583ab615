//! KVPS error types.

use thiserror::Error;

/// Errors surfaced by the KVPS adapter.
#[derive(Debug, Error)]
pub enum KvpsError {
    /// Transport or protocol error from the underlying store.
    #[error("kvps error: {0}")]
    Store(#[from] redis::RedisError),

    /// An operation exceeded its bounded timeout.
    #[error("kvps operation timed out")]
    Timeout,

    /// The subscriber dispatch task is no longer running.
    #[error("kvps subscriber closed")]
    SubscriberClosed,
}

/// Result type for KVPS operations.
pub type Result<T> = std::result::Result<T, KvpsError>;
