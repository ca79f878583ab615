//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Directory / pub/sub backend error.
    #[error("kvps error: {0}")]
    Kvps(#[from] kvps_client::KvpsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client not found in the local registry.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// The client's egress queue is closed or full.
    #[error("egress closed")]
    EgressClosed,

    /// Malformed or invalid client request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
