//! Packager capability and the local Ed25519 implementation.
//!
//! Envelopes are authenticated: each recipient gets the content key wrapped
//! under an X25519 agreement between the sender's and recipient's Ed25519
//! keys (converted to Montgomery form), and the message is sealed with
//! ChaCha20-Poly1305 using the encoded protected header as associated data.

use crate::{PipeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::MontgomeryPoint;
use dca_core::keys::decode_verkey;
use dca_core::{IdentityKey, KeyLookup};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

const ENVELOPE_ALG: &str = "Authcrypt";
const ENVELOPE_ENC: &str = "chacha20poly1305_ietf";
const KDF_INFO: &[u8] = b"dca-authcrypt-v1";

/// Result of unpacking an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub message: Vec<u8>,
    /// Verkey of the sender, authenticated by the key agreement.
    pub sender_key: String,
    /// Our verkey the envelope was opened with.
    pub recipient_key: String,
}

/// Cryptographic capability used by pipes.
pub trait Packager: Send + Sync {
    /// Encrypt `message` from `from_key` to every key in `to_keys`.
    fn pack(&self, message: &[u8], from_key: &str, to_keys: &[String]) -> Result<Vec<u8>>;

    /// Open an envelope addressed to any key we hold.
    fn unpack(&self, envelope: &[u8]) -> Result<Unpacked>;

    /// Sign with one of our keys, found by verkey or DID.
    fn sign(&self, data: &[u8], kid: &str) -> Result<Vec<u8>>;

    /// Verify a signature against a base58 verkey.
    fn verify(&self, data: &[u8], signature: &[u8], verkey: &str) -> Result<()>;

    /// Key-management lookup backing this packager.
    fn kms(&self) -> &dyn KeyLookup;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    protected: String,
    iv: String,
    ciphertext: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Protected {
    enc: String,
    alg: String,
    sender: String,
    recipients: Vec<Recipient>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Recipient {
    kid: String,
    nonce: String,
    encrypted_key: String,
}

/// Packager backed by the agent's own key lookup.
#[derive(Clone)]
pub struct LocalPackager {
    kms: Arc<dyn KeyLookup>,
}

impl LocalPackager {
    pub fn new(kms: Arc<dyn KeyLookup>) -> Self {
        Self { kms }
    }

    fn wrapping_key(my_key: &IdentityKey, their_verkey: &str, sender: &str, recipient: &str) -> Result<[u8; 32]> {
        let their_point: MontgomeryPoint = decode_verkey(their_verkey)?.to_montgomery();
        let shared = their_point.mul_clamped(my_key.agreement_scalar());

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut info = Vec::with_capacity(KDF_INFO.len() + sender.len() + recipient.len());
        info.extend_from_slice(KDF_INFO);
        info.extend_from_slice(sender.as_bytes());
        info.extend_from_slice(recipient.as_bytes());

        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|_| PipeError::Malformed("key derivation length".into()))?;
        Ok(okm)
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| PipeError::Malformed(format!("{}: {}", field, e)))
}

fn nonce_of(field: &str, value: &str) -> Result<[u8; 12]> {
    decode_b64(field, value)?
        .try_into()
        .map_err(|_| PipeError::Malformed(format!("{}: nonce must be 12 bytes", field)))
}

impl Packager for LocalPackager {
    fn pack(&self, message: &[u8], from_key: &str, to_keys: &[String]) -> Result<Vec<u8>> {
        if to_keys.is_empty() {
            return Err(PipeError::Malformed("no recipient keys".into()));
        }
        let sender = self.kms.key(from_key)?;
        let sender_verkey = sender.verkey();

        let cek = random_bytes::<32>();
        let mut recipients = Vec::with_capacity(to_keys.len());
        for to in to_keys {
            let kek = Self::wrapping_key(&sender, to, &sender_verkey, to)?;
            let nonce = random_bytes::<12>();
            let encrypted_key = ChaCha20Poly1305::new(Key::from_slice(&kek))
                .encrypt(Nonce::from_slice(&nonce), &cek[..])
                .map_err(|_| PipeError::Malformed("content key wrap".into()))?;
            recipients.push(Recipient {
                kid: to.clone(),
                nonce: URL_SAFE_NO_PAD.encode(nonce),
                encrypted_key: URL_SAFE_NO_PAD.encode(encrypted_key),
            });
        }

        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Protected {
            enc: ENVELOPE_ENC.to_string(),
            alg: ENVELOPE_ALG.to_string(),
            sender: sender_verkey,
            recipients,
        })?);

        let iv = random_bytes::<12>();
        let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&cek))
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: message,
                    aad: protected.as_bytes(),
                },
            )
            .map_err(|_| PipeError::Malformed("message encryption".into()))?;

        Ok(serde_json::to_vec(&Envelope {
            protected,
            iv: URL_SAFE_NO_PAD.encode(iv),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        })?)
    }

    fn unpack(&self, envelope: &[u8]) -> Result<Unpacked> {
        let envelope: Envelope = serde_json::from_slice(envelope)
            .map_err(|e| PipeError::Malformed(format!("envelope: {}", e)))?;
        let protected: Protected = serde_json::from_slice(&decode_b64("protected", &envelope.protected)?)
            .map_err(|e| PipeError::Malformed(format!("protected header: {}", e)))?;
        if protected.alg != ENVELOPE_ALG || protected.enc != ENVELOPE_ENC {
            return Err(PipeError::Malformed(format!(
                "unsupported envelope {}/{}",
                protected.alg, protected.enc
            )));
        }

        let (recipient, my_key) = protected
            .recipients
            .iter()
            .find_map(|r| self.kms.key(&r.kid).ok().map(|key| (r, key)))
            .ok_or_else(|| {
                PipeError::KeyNotFound(
                    protected
                        .recipients
                        .iter()
                        .map(|r| r.kid.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                )
            })?;

        let kek = Self::wrapping_key(&my_key, &protected.sender, &protected.sender, &recipient.kid)?;
        let cek = ChaCha20Poly1305::new(Key::from_slice(&kek))
            .decrypt(
                Nonce::from_slice(&nonce_of("nonce", &recipient.nonce)?),
                decode_b64("encrypted_key", &recipient.encrypted_key)?.as_slice(),
            )
            .map_err(|_| PipeError::Decrypt)?;
        if cek.len() != 32 {
            return Err(PipeError::Decrypt);
        }

        let message = ChaCha20Poly1305::new(Key::from_slice(&cek))
            .decrypt(
                Nonce::from_slice(&nonce_of("iv", &envelope.iv)?),
                Payload {
                    msg: &decode_b64("ciphertext", &envelope.ciphertext)?,
                    aad: envelope.protected.as_bytes(),
                },
            )
            .map_err(|_| PipeError::Decrypt)?;

        Ok(Unpacked {
            message,
            sender_key: protected.sender,
            recipient_key: recipient.kid.clone(),
        })
    }

    fn sign(&self, data: &[u8], kid: &str) -> Result<Vec<u8>> {
        let key = self.kms.key(kid)?;
        Ok(key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8], verkey: &str) -> Result<()> {
        dca_core::keys::verify(verkey, data, signature)?;
        Ok(())
    }

    fn kms(&self) -> &dyn KeyLookup {
        self.kms.as_ref()
    }
}
