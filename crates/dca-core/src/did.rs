//! Pairwise DID handling.
//!
//! A DID is the base58 encoding of the first 16 bytes of an Ed25519
//! verification key, which always yields 21 or 22 characters. The
//! fully qualified form is `did:sov:<id>`.

use crate::{Error, Result};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shortest valid DID.
pub const DID_LENGTH_MIN: usize = 21;

/// Longest valid DID.
pub const DID_LENGTH_MAX: usize = 22;

/// Method prefix of a fully qualified DID.
pub const DID_METHOD_PREFIX: &str = "did:sov:";

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Report whether `s` is a syntactically valid (unqualified) DID.
pub fn is_did(s: &str) -> bool {
    let len = s.len();
    (DID_LENGTH_MIN..=DID_LENGTH_MAX).contains(&len)
        && s.bytes().all(|b| BASE58_ALPHABET.contains(&b))
}

/// A parsed, unqualified DID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    /// Derive the DID owned by a verification key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(bs58::encode(&key.as_bytes()[..16]).into_string())
    }

    /// The unqualified identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `did:sov:` qualified form.
    pub fn qualified(&self) -> String {
        format!("{}{}", DID_METHOD_PREFIX, self.0)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let id = s.strip_prefix(DID_METHOD_PREFIX).unwrap_or(s);
        if !is_did(id) {
            return Err(Error::InvalidDid(format!(
                "expected {}-{} base58 characters, got '{}'",
                DID_LENGTH_MIN, DID_LENGTH_MAX, s
            )));
        }
        Ok(Self(id.to_string()))
    }
}

impl TryFrom<String> for Did {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
