//! Error types for state machine storage.

use crate::{Direction, StateKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PsmError {
    #[error("Illegal transition for {key}: {from:?} -> {to}")]
    IllegalTransition {
        key: StateKey,
        from: Option<Direction>,
        to: Direction,
    },

    #[error("Not found in bucket '{bucket}': {key}")]
    NotFound { bucket: String, key: String },

    #[error("No decoder registered for representative tag {0}")]
    UnknownRepTag(u8),

    #[error("Representative with tag {0} has an unexpected type")]
    RepMismatch(u8),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl PsmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PsmError::NotFound { .. })
    }
}
