//! Connection signature (`connection~sig`).
//!
//! The addressee signs the JSON of its [`Connection`] prefixed with an
//! 8-byte timestamp. The initiator accepts the response only while the
//! timestamp is fresh.

use super::messages::Connection;
use crate::{ProtocolError, Result};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use dca_core::Identity;
use dca_pipe::{Packager, Pipe, PipeError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SIG_TYPE: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/signature/1.0/ed25519Sha512_single";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSignature {
    #[serde(rename = "@type")]
    pub type_: String,
    /// URL-safe base64 of the signature.
    pub signature: String,
    /// URL-safe base64 of the stamped connection JSON.
    pub sig_data: String,
    /// Verkey of the signer.
    pub signer: String,
}

/// Sign `connection` with the pipe's local key.
pub fn sign(connection: &Connection, pipe: &Pipe) -> Result<ConnectionSignature> {
    sign_at(connection, pipe, chrono::Utc::now().timestamp())
}

/// Sign with an explicit timestamp.
pub fn sign_at(connection: &Connection, pipe: &Pipe, now: i64) -> Result<ConnectionSignature> {
    let data = serde_json::to_vec(connection)?;
    let (stamped, signature, signer) = pipe.sign_and_stamp_at(&data, now)?;
    Ok(ConnectionSignature {
        type_: SIG_TYPE.to_string(),
        signature: URL_SAFE.encode(signature),
        sig_data: URL_SAFE.encode(stamped),
        signer,
    })
}

/// Verify the signature and return the signed connection.
///
/// Without a pipe the signer's key from the signature is used. A pipe
/// whose remote key is not the signer is a caller bug.
pub fn verify(
    sig: &ConnectionSignature,
    pipe: Option<&Pipe>,
    packager: &Arc<dyn Packager>,
) -> Result<Connection> {
    verify_at(sig, pipe, packager, chrono::Utc::now().timestamp())
}

/// Verify at an explicit time.
pub fn verify_at(
    sig: &ConnectionSignature,
    pipe: Option<&Pipe>,
    packager: &Arc<dyn Packager>,
    now: i64,
) -> Result<Connection> {
    let verifier = match pipe {
        Some(pipe) if pipe.remote.verkey != sig.signer => {
            return Err(ProtocolError::Invariant(format!(
                "verifying pipe is for {}, signature is by {}",
                pipe.remote.verkey, sig.signer
            )));
        }
        Some(pipe) => pipe.clone(),
        None => Pipe::null(packager.clone(), Identity::out(sig.signer.clone(), Vec::new())),
    };

    let data = decode_b64("sig_data", &sig.sig_data)?;
    if data.is_empty() {
        return Err(PipeError::Malformed("missing signature data".into()).into());
    }
    let signature = decode_b64("signature", &sig.signature)?;

    let body = verifier.verify_stamped(&data, &signature, now).map_err(|e| {
        warn!(signer = %sig.signer, error = %e, "connection signature rejected");
        e
    })?;
    let connection: Connection = serde_json::from_slice(body)?;
    if connection.did_doc.verkey() != Some(sig.signer.as_str()) {
        warn!(signer = %sig.signer, did = %connection.did, "signer does not own the DID document");
        return Err(PipeError::InvalidSignature.into());
    }
    debug!(signer = %sig.signer, did = %connection.did, "connection signature verified");
    Ok(connection)
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE
        .decode(value)
        .or_else(|_| URL_SAFE_NO_PAD.decode(value))
        .map_err(|e| PipeError::Malformed(format!("{}: {}", field, e)).into())
}
