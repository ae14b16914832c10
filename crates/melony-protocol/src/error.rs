//! Error types for the Melony protocol.

use thiserror::Error;

/// Errors surfaced by protocol-level operations and port implementations.
#[derive(Debug, Error)]
pub enum MelonyError {
    #[error("payload mismatch: expected {expected}, got {actual}")]
    PayloadMismatch { expected: String, actual: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl From<serde_json::Error> for MelonyError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for protocol operations.
pub type MelonyResult<T> = Result<T, MelonyError>;
