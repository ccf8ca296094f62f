//! Error types for dca-core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid DID format: {0}")]
    InvalidDid(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid verification key: {0}")]
    InvalidVerkey(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid base58 encoding: {0}")]
    Base58(String),

    #[error("Programming invariant violated: {0}")]
    Invariant(String),
}
