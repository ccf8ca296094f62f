//! Agent wallet.
//!
//! Holds every [`IdentityKey`] the agent controls and answers key lookups
//! by verification key or DID. Cryptographic code never sees the wallet
//! directly, only the [`KeyLookup`] capability.

use crate::{Error, Identity, IdentityKey, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Key-management lookup capability.
pub trait KeyLookup: Send + Sync {
    /// Find a key by its base58 verkey or by its DID.
    fn key(&self, kid: &str) -> Result<Arc<IdentityKey>>;
}

/// In-memory key storage for one agent.
#[derive(Debug, Default)]
pub struct Wallet {
    by_verkey: RwLock<HashMap<String, Arc<IdentityKey>>>,
    did_to_verkey: RwLock<HashMap<String, String>>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a fresh identity, e.g. for a new pairwise relationship.
    pub fn new_identity(&self) -> Identity {
        let key = IdentityKey::generate();
        let identity = key.identity();
        self.insert(key);
        identity
    }

    /// Store an existing key and return its public identity.
    pub fn insert(&self, key: IdentityKey) -> Identity {
        let identity = key.identity();
        self.did_to_verkey
            .write()
            .insert(identity.did.clone(), identity.verkey.clone());
        self.by_verkey
            .write()
            .insert(identity.verkey.clone(), Arc::new(key));
        identity
    }

    /// Public identity of one of our DIDs.
    pub fn identity(&self, did: &str) -> Result<Identity> {
        Ok(self.key(did)?.identity())
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.key(kid).is_ok()
    }

    pub fn len(&self) -> usize {
        self.by_verkey.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyLookup for Wallet {
    fn key(&self, kid: &str) -> Result<Arc<IdentityKey>> {
        let kid = kid.strip_prefix(crate::did::DID_METHOD_PREFIX).unwrap_or(kid);
        if let Some(key) = self.by_verkey.read().get(kid) {
            return Ok(key.clone());
        }
        let verkey = self
            .did_to_verkey
            .read()
            .get(kid)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(kid.to_string()))?;
        self.by_verkey
            .read()
            .get(&verkey)
            .cloned()
            .ok_or(Error::KeyNotFound(verkey))
    }
}
