//! Directed secure channel between our identity and the other end.

use crate::stamp::{stamp, verify_stamp};
use crate::{Packager, PipeError, Result};
use dca_core::Identity;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Message type used to wrap an envelope for a mediator.
pub const FORWARD_TYPE: &str = "https://didcomm.org/routing/1.0/forward";

#[derive(Serialize)]
struct Forward<'a> {
    #[serde(rename = "@type")]
    type_: &'static str,
    to: &'a str,
    msg: serde_json::Value,
}

/// Secure pipe from `local` (ours) to `remote` (theirs).
///
/// A pipe without a local identity is a null pipe. It can still verify
/// signatures made by the remote end but cannot pack, unpack or sign.
#[derive(Clone)]
pub struct Pipe {
    pub local: Option<Identity>,
    pub remote: Identity,
    packager: Arc<dyn Packager>,
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("local", &self.local.as_ref().map(|id| id.did.as_str()))
            .field("remote", &self.remote.did)
            .finish_non_exhaustive()
    }
}

impl Pipe {
    pub fn new(packager: Arc<dyn Packager>, local: Identity, remote: Identity) -> Self {
        Self {
            local: Some(local),
            remote,
            packager,
        }
    }

    /// Pipe that only knows the other end, e.g. for verifying a response.
    pub fn null(packager: Arc<dyn Packager>, remote: Identity) -> Self {
        Self {
            local: None,
            remote,
            packager,
        }
    }

    pub fn is_null(&self) -> bool {
        self.local.is_none()
    }

    fn local(&self) -> Result<&Identity> {
        self.local.as_ref().ok_or(PipeError::NullPipe)
    }

    /// Encrypt for the remote end and wrap for each mediator on its route.
    ///
    /// Returns the outermost envelope and our verkey.
    pub fn pack(&self, plaintext: &[u8]) -> Result<(Vec<u8>, String)> {
        let local = self.local()?;
        let mut envelope =
            self.packager
                .pack(plaintext, &local.verkey, std::slice::from_ref(&self.remote.verkey))?;

        let mut to = self.remote.verkey.as_str();
        for route_key in &self.remote.route {
            let forward = serde_json::to_vec(&Forward {
                type_: FORWARD_TYPE,
                to,
                msg: serde_json::from_slice(&envelope)?,
            })?;
            envelope = self
                .packager
                .pack(&forward, &local.verkey, std::slice::from_ref(route_key))?;
            to = route_key.as_str();
        }
        Ok((envelope, local.verkey.clone()))
    }

    /// Decrypt an envelope addressed to us.
    ///
    /// Returns the plaintext and the sender's verkey. When the remote
    /// identity is known the sender must be that identity.
    pub fn unpack(&self, ciphertext: &[u8]) -> Result<(Vec<u8>, String)> {
        self.local()?;
        let unpacked = self.packager.unpack(ciphertext)?;
        if !self.remote.verkey.is_empty() && unpacked.sender_key != self.remote.verkey {
            return Err(PipeError::UnexpectedSender {
                expected: self.remote.verkey.clone(),
                got: unpacked.sender_key,
            });
        }
        Ok((unpacked.message, unpacked.sender_key))
    }

    /// Sign with our key. Returns the signature and our verkey.
    pub fn sign(&self, data: &[u8]) -> Result<(Vec<u8>, String)> {
        let local = self.local()?;
        let signature = self.packager.sign(data, &local.verkey)?;
        Ok((signature, local.verkey.clone()))
    }

    /// Verify a signature made by the remote end. Returns the verkey used.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<String> {
        if self.remote.verkey.is_empty() {
            return Err(PipeError::KeyNotFound("remote verkey".into()));
        }
        self.packager.verify(data, signature, &self.remote.verkey)?;
        Ok(self.remote.verkey.clone())
    }

    /// Prefix the current time and sign the result.
    ///
    /// Returns the stamped data, the signature over it and our verkey.
    pub fn sign_and_stamp(&self, data: &[u8]) -> Result<(Vec<u8>, Vec<u8>, String)> {
        self.sign_and_stamp_at(data, chrono::Utc::now().timestamp())
    }

    pub fn sign_and_stamp_at(&self, data: &[u8], now: i64) -> Result<(Vec<u8>, Vec<u8>, String)> {
        let stamped = stamp(data, now);
        let (signature, verkey) = self.sign(&stamped)?;
        Ok((stamped, signature, verkey))
    }

    /// Verify a stamped signature from the remote end at `now`.
    ///
    /// The signature is checked first, then the stamp. Returns the data
    /// after the stamp.
    pub fn verify_stamped<'a>(&self, stamped: &'a [u8], signature: &[u8], now: i64) -> Result<&'a [u8]> {
        self.verify(stamped, signature)?;
        let (_, data) = verify_stamp(stamped, now)?;
        Ok(data)
    }
}
