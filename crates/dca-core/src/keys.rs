//! Key management for agent identities.
//!
//! # Security
//!
//! Secret key bytes are zeroized on drop by `ed25519-dalek`'s `SigningKey`,
//! and `Debug` only shows public information.

use crate::{Did, Error, Result, ServiceAddr};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An Ed25519 key pair owned by this agent.
///
/// One key backs every DID the agent controls: its own agent DID and each
/// pairwise DID it creates for a relationship.
pub struct IdentityKey {
    signing_key: SigningKey,
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("did", &self.did().to_string())
            .field("verkey", &self.verkey())
            .finish_non_exhaustive()
    }
}

impl IdentityKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from an existing 32-byte seed.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// The DID derived from this key.
    pub fn did(&self) -> Did {
        Did::from_verifying_key(&self.signing_key.verifying_key())
    }

    /// Base58 encoded verification key.
    pub fn verkey(&self) -> String {
        bs58::encode(self.signing_key.verifying_key().as_bytes()).into_string()
    }

    /// Get the public verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Unclamped Curve25519 scalar bytes used for X25519 key agreement.
    pub fn agreement_scalar(&self) -> [u8; 32] {
        self.signing_key.to_scalar_bytes()
    }

    /// Public description of this key without routing or endpoint.
    pub fn identity(&self) -> Identity {
        Identity {
            did: self.did().to_string(),
            verkey: self.verkey(),
            route: Vec::new(),
            endpoint: None,
        }
    }

    /// Get the secret seed bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Public description of one end of a pairwise relationship.
///
/// An identity carries no secrets. For our own identities the matching
/// [`IdentityKey`] lives in the [`crate::Wallet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub did: String,
    pub verkey: String,
    /// Routing keys of mediators between us and this identity.
    #[serde(default)]
    pub route: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<ServiceAddr>,
}

impl Identity {
    /// Build the identity of the other end from its verification key.
    ///
    /// The DID is derived from the key when the key decodes, which matches
    /// how peers derive pairwise DIDs.
    pub fn out(verkey: impl Into<String>, route: Vec<String>) -> Self {
        let verkey = verkey.into();
        let did = decode_verkey(&verkey)
            .map(|key| Did::from_verifying_key(&key).to_string())
            .unwrap_or_default();
        Self {
            did,
            verkey,
            route,
            endpoint: None,
        }
    }

    /// Identity with an explicit DID.
    pub fn new(did: impl Into<String>, verkey: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            verkey: verkey.into(),
            route: Vec::new(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: ServiceAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_route(mut self, route: Vec<String>) -> Self {
        self.route = route;
        self
    }
}

/// Decode a base58 verification key.
pub fn decode_verkey(verkey: &str) -> Result<VerifyingKey> {
    let bytes = bs58::decode(verkey)
        .into_vec()
        .map_err(|e| Error::Base58(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidVerkey(format!("'{}' is not 32 bytes", verkey)))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::InvalidVerkey(e.to_string()))
}

/// Verify a signature against a base58 verification key.
pub fn verify(verkey: &str, message: &[u8], signature: &[u8]) -> Result<()> {
    let public_key = decode_verkey(verkey)?;
    let signature = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;
    public_key
        .verify(message, &signature)
        .map_err(|_| Error::InvalidSignature)
}
