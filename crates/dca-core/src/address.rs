//! Transport addresses.
//!
//! An agent endpoint has the form
//! `{base}/{service}/{plaintextReceiver}[/{msgReceiver}[/{pairwiseDid}[/{edgeToken}]]]`.
//! Addresses received by the server carry only the path; addresses held by
//! a client carry the scheme and host as `base_path`.

use crate::{is_did, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Endpoint names that are reachable without an encrypted envelope.
pub const UNENCRYPTED_ENDPOINTS: &[&str] = &["ping", "handshake"];

/// Public endpoint: URL plus the verification key to pack for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAddr {
    pub endp: String,
    pub key: String,
}

impl ServiceAddr {
    pub fn new(endp: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            endp: endp.into(),
            key: key.into(),
        }
    }
}

/// Decoded transport address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    /// Journal id of the payload that arrived at this address.
    pub id: u64,
    pub service: String,
    /// Plaintext receiver: the agent DID or an unencrypted endpoint name.
    pub pl_rcvr: String,
    pub msg_rcvr: String,
    /// Our pairwise DID for the relationship.
    pub rcvr_did: String,
    /// Final routing token; carries the invitation id.
    pub edge_token: String,
    pub base_path: String,
    /// Verkey of the sender once the envelope is unpacked.
    pub verkey: String,
}

impl Addr {
    /// Decode a server-side request path such as `/agent/<did>/<did>/<pw>`.
    pub fn from_server_path(path: &str) -> Self {
        let mut addr = Self::default();
        addr.fill_segments(path);
        addr
    }

    /// Decode a full client URL including scheme and host.
    pub fn from_client_url(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::InvalidAddress(format!("missing scheme in '{}'", url)))?;
        if scheme.is_empty() {
            return Err(Error::InvalidAddress(format!("empty scheme in '{}'", url)));
        }
        let (host, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in '{}'", url)));
        }
        let path = path.split(['?', '#']).next().unwrap_or_default();

        let mut addr = Self {
            base_path: format!("{}://{}", scheme, host),
            ..Self::default()
        };
        addr.fill_segments(path);
        Ok(addr)
    }

    /// Client address with the key to pack for.
    pub fn from_public(service: &ServiceAddr) -> Result<Self> {
        let mut addr = Self::from_client_url(&service.endp)?;
        addr.verkey = service.key.clone();
        Ok(addr)
    }

    fn fill_segments(&mut self, path: &str) {
        for (i, part) in path.split('/').enumerate() {
            match i {
                1 => self.service = part.to_string(),
                2 => self.pl_rcvr = part.to_string(),
                3 => self.msg_rcvr = part.to_string(),
                4 => self.rcvr_did = part.to_string(),
                5 => self.edge_token = part.to_string(),
                _ => {}
            }
        }
    }

    /// An address is valid when it names an unencrypted endpoint or all of
    /// its DID segments are DIDs.
    pub fn is_valid(&self) -> bool {
        if is_in_endpoints(&self.pl_rcvr) {
            return true;
        }
        is_did(&self.pl_rcvr) && is_did(&self.msg_rcvr) && is_did(&self.rcvr_did)
    }

    pub fn is_encrypted(&self) -> bool {
        !is_in_endpoints(&self.pl_rcvr)
    }

    /// The agent that receives the payload.
    pub fn receiver_did(&self) -> &str {
        if self.msg_rcvr.is_empty() {
            &self.pl_rcvr
        } else {
            &self.msg_rcvr
        }
    }

    /// The agent that handles the message, preferring the pairwise DID.
    pub fn msg_level_did(&self) -> &str {
        if self.rcvr_did.is_empty() {
            self.receiver_did()
        } else {
            &self.rcvr_did
        }
    }

    /// DID used to decrypt the transport envelope.
    pub fn payload_transport_did(&self) -> Result<&str> {
        if self.is_encrypted() {
            Ok(&self.pl_rcvr)
        } else {
            Err(Error::Invariant(format!(
                "unencrypted endpoint '{}' has no transport DID",
                self.pl_rcvr
            )))
        }
    }

    /// Render the address, with base path when one is known.
    pub fn address(&self) -> String {
        let mut out = format!("{}/{}/{}", self.base_path, self.service, self.pl_rcvr);
        for part in [&self.msg_rcvr, &self.rcvr_did, &self.edge_token] {
            if part.is_empty() {
                break;
            }
            out.push('/');
            out.push_str(part);
        }
        out.trim_end_matches('/').to_string()
    }

    /// URL and key as a public endpoint.
    pub fn to_public(&self) -> ServiceAddr {
        ServiceAddr::new(self.address(), self.verkey.clone())
    }

    /// Journal key of the payload received at this address.
    pub fn key(&self) -> [u8; 8] {
        self.id.to_le_bytes()
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Report whether the name is one of the unencrypted endpoints.
pub fn is_in_endpoints(name: &str) -> bool {
    UNENCRYPTED_ENDPOINTS.contains(&name)
}
