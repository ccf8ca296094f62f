//! Protocol specific representatives and their decoder registry.

use crate::{PsmError, Result, StateKey};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Protocol specific record stored next to a conversation's PSM.
///
/// Each variant owns one tag; the store keeps one record per tag and
/// [`StateKey`], overwriting on every write.
pub trait Rep: fmt::Debug + Send + Sync + 'static {
    fn key(&self) -> &StateKey;
    fn tag(&self) -> u8;
    fn data(&self) -> Result<Vec<u8>>;
    fn as_any(&self) -> &dyn Any;
}

/// Decode stored bytes back into a representative.
pub type RepDecoder = fn(&[u8]) -> Result<Box<dyn Rep>>;

/// Encode a record with the persistence codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a record with the persistence codec.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Tag to decoder table.
///
/// Registration is idempotent and the last decoder for a tag wins.
#[derive(Default)]
pub struct RepRegistry {
    decoders: RwLock<HashMap<u8, RepDecoder>>,
}

impl fmt::Debug for RepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<u8> = self.decoders.read().keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("RepRegistry").field("tags", &tags).finish()
    }
}

impl RepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tag: u8, decoder: RepDecoder) {
        if self.decoders.write().insert(tag, decoder).is_some() {
            tracing::debug!(tag, "replaced representative decoder");
        }
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.decoders.read().contains_key(&tag)
    }

    pub fn decode(&self, tag: u8, bytes: &[u8]) -> Result<Box<dyn Rep>> {
        let decoder = self
            .decoders
            .read()
            .get(&tag)
            .copied()
            .ok_or(PsmError::UnknownRepTag(tag))?;
        decoder(bytes)
    }
}

/// Downcast a decoded representative to its concrete type.
pub fn downcast<T: Rep + Clone>(rep: &dyn Rep) -> Result<T> {
    rep.as_any()
        .downcast_ref::<T>()
        .cloned()
        .ok_or(PsmError::RepMismatch(rep.tag()))
}
