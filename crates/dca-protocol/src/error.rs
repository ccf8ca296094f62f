//! Error types for protocol processing.

use crate::transport::TransportError;
use dca_pipe::PipeError;
use dca_psm::PsmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] PipeError),

    #[error("State error: {0}")]
    State(#[from] PsmError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No processor registered for protocol '{0}'")]
    UnknownProtocol(String),

    #[error("Protocol '{protocol}' has no handler for '{message}'")]
    UnknownMessage { protocol: String, message: String },

    #[error("No agent for DID '{0}'")]
    UnknownAgent(String),

    #[error("No pairwise connection '{0}'")]
    UnknownConnection(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Core error: {0}")]
    Core(dca_core::Error),
}

impl ProtocolError {
    /// Lookup of something that does not exist, as opposed to a broken store.
    pub fn is_not_found(&self) -> bool {
        match self {
            ProtocolError::State(e) => e.is_not_found(),
            ProtocolError::Core(dca_core::Error::KeyNotFound(_)) => true,
            ProtocolError::UnknownAgent(_) | ProtocolError::UnknownConnection(_) => true,
            _ => false,
        }
    }

    /// Missing processor or handler for a type.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownProtocol(_) | ProtocolError::UnknownMessage { .. }
        )
    }
}

impl From<dca_core::Error> for ProtocolError {
    fn from(err: dca_core::Error) -> Self {
        match err {
            dca_core::Error::InvalidDid(msg) | dca_core::Error::InvalidAddress(msg) => {
                ProtocolError::Validation(msg)
            }
            dca_core::Error::Invariant(msg) => ProtocolError::Invariant(msg),
            other => ProtocolError::Core(other),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Validation(format!("message structure: {}", err))
    }
}
