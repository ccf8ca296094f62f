//! Error types for secure pipe operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("Pipe has no local identity bound")]
    NullPipe,

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Cannot decrypt envelope")]
    Decrypt,

    #[error("Envelope from {got}, expected {expected}")]
    UnexpectedSender { expected: String, got: String },

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Signature timestamp {timestamp} outside freshness window at {now}")]
    StampExpired { timestamp: i64, now: i64 },

    #[error("Core error: {0}")]
    Core(dca_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<dca_core::Error> for PipeError {
    fn from(err: dca_core::Error) -> Self {
        match err {
            dca_core::Error::KeyNotFound(kid) => PipeError::KeyNotFound(kid),
            dca_core::Error::InvalidSignature => PipeError::InvalidSignature,
            other => PipeError::Core(other),
        }
    }
}
