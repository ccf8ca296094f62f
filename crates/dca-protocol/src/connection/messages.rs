//! Connection protocol messages and the pairwise DID document.

use super::signature::ConnectionSignature;
use super::FAMILY;
use crate::payload::{message_type, DIDCOMM_PREFIX, LEGACY_PREFIX};
use crate::{ProtocolError, Result};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use dca_core::{Identity, ServiceAddr};
use serde::{Deserialize, Serialize};

const INVITATION: &str = "invitation";
const DID_CONTEXT: &str = "https://w3id.org/did/v1";
const KEY_TYPE: &str = "Ed25519VerificationKey2018";
const SERVICE_TYPE: &str = "IndyAgent";

/// Out-of-band invitation to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "@type")]
    pub type_: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "recipientKeys", default)]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint", default)]
    pub service_endpoint: String,
    #[serde(rename = "routingKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
}

impl Invitation {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        recipient_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            type_: message_type(DIDCOMM_PREFIX, FAMILY, INVITATION),
            id: id.into(),
            label: label.into(),
            recipient_keys: vec![recipient_key.into()],
            service_endpoint: endpoint.into(),
            routing_keys: Vec::new(),
        }
    }

    /// Parse invitation JSON in either type dialect.
    pub fn translate(json: &str) -> Result<Self> {
        let invitation: Self = serde_json::from_str(json)?;
        invitation.validate()?;
        Ok(invitation)
    }

    /// Decode the `c_i` query parameter of an invitation URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let query = url
            .split_once('?')
            .map(|(_, q)| q)
            .ok_or_else(|| ProtocolError::Validation(format!("no query in invitation URL '{}'", url)))?;
        let encoded = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("c_i="))
            .ok_or_else(|| ProtocolError::Validation("invitation URL has no c_i parameter".into()))?;
        let encoded = encoded.replace("%3D", "=").replace("%3d", "=");
        let encoded = encoded.trim_end_matches('=');

        let json = URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| STANDARD_NO_PAD.decode(encoded))
            .map_err(|e| ProtocolError::Validation(format!("invitation encoding: {}", e)))?;
        let json = String::from_utf8(json)
            .map_err(|e| ProtocolError::Validation(format!("invitation encoding: {}", e)))?;
        Self::translate(&json)
    }

    /// Invitation URL rooted at `base`.
    pub fn to_url(&self, base: &str) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{}?c_i={}", base, URL_SAFE_NO_PAD.encode(json)))
    }

    pub fn validate(&self) -> Result<()> {
        let known = [DIDCOMM_PREFIX, LEGACY_PREFIX]
            .iter()
            .any(|prefix| self.type_ == message_type(prefix, FAMILY, INVITATION));
        if !known {
            return Err(ProtocolError::Validation(format!(
                "'{}' is not an invitation type",
                self.type_
            )));
        }
        if self.id.is_empty() {
            return Err(ProtocolError::Validation("invitation has no id".into()));
        }
        self.recipient_key()?;
        if self.service_endpoint.is_empty() {
            return Err(ProtocolError::Validation("invitation has no service endpoint".into()));
        }
        Ok(())
    }

    /// Key the first message is packed for.
    pub fn recipient_key(&self) -> Result<&str> {
        self.recipient_keys
            .first()
            .map(String::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ProtocolError::Validation("invitation has no recipient key".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub controller: String,
    #[serde(rename = "publicKeyBase58")]
    pub public_key_base58: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(rename = "recipientKeys", default)]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "routingKeys", default)]
    pub routing_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint", default)]
    pub service_endpoint: String,
}

/// DID document of one end of a pairwise relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidDoc {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "publicKey", default)]
    pub public_key: Vec<PublicKey>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

impl DidDoc {
    pub fn new(identity: &Identity, endpoint: &ServiceAddr) -> Self {
        Self {
            context: DID_CONTEXT.to_string(),
            id: identity.did.clone(),
            public_key: vec![PublicKey {
                id: format!("{}#1", identity.did),
                type_: KEY_TYPE.to_string(),
                controller: identity.did.clone(),
                public_key_base58: identity.verkey.clone(),
            }],
            service: vec![DidService {
                id: format!("{};indy", identity.did),
                type_: SERVICE_TYPE.to_string(),
                priority: 0,
                recipient_keys: vec![identity.verkey.clone()],
                routing_keys: identity.route.clone(),
                service_endpoint: endpoint.endp.clone(),
            }],
        }
    }

    pub fn verkey(&self) -> Option<&str> {
        self.public_key.first().map(|k| k.public_key_base58.as_str())
    }

    /// A usable document names a key and a service with endpoint and
    /// recipient key.
    pub fn validate(&self) -> Result<&DidService> {
        if self.verkey().map_or(true, str::is_empty) {
            return Err(ProtocolError::Validation(format!("DID document {} has no key", self.id)));
        }
        let service = self
            .service
            .first()
            .ok_or_else(|| ProtocolError::Validation(format!("DID document {} has no service", self.id)))?;
        if service.service_endpoint.is_empty() || service.recipient_keys.is_empty() {
            return Err(ProtocolError::Validation(format!(
                "service of DID document {} has no endpoint or key",
                self.id
            )));
        }
        Ok(service)
    }
}

/// Pairwise DID plus its document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(rename = "DIDDoc")]
    pub did_doc: DidDoc,
}

impl Connection {
    pub fn new(identity: &Identity, endpoint: &ServiceAddr) -> Self {
        Self {
            did: identity.did.clone(),
            did_doc: DidDoc::new(identity, endpoint),
        }
    }

    /// The other end as described by its document.
    pub fn their_identity(&self) -> Result<Identity> {
        let service = self.did_doc.validate()?;
        let verkey = service.recipient_keys[0].clone();
        Ok(Identity::new(self.did.clone(), verkey.clone())
            .with_route(service.routing_keys.clone())
            .with_endpoint(ServiceAddr::new(service.service_endpoint.clone(), verkey)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub label: String,
    pub connection: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "connection~sig")]
    pub connection_sig: ConnectionSignature,
}
