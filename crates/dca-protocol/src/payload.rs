//! DIDComm plaintext messages.
//!
//! Every message carries `@id`, `@type` and an optional `~thread`
//! decorator. The rest of the JSON object is the message body, kept
//! untyped here and decoded by the protocol that owns the type.

use crate::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of current message type URIs.
pub const DIDCOMM_PREFIX: &str = "https://didcomm.org/";

/// Prefix used by older agents for the same protocols.
pub const LEGACY_PREFIX: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

/// Build a protocol URI such as `https://didcomm.org/connections/1.0`.
pub fn protocol_uri(prefix: &str, family: &str) -> String {
    format!("{}{}", prefix, family)
}

/// Build a message type URI such as `https://didcomm.org/connections/1.0/request`.
pub fn message_type(prefix: &str, family: &str, name: &str) -> String {
    format!("{}{}/{}", prefix, family, name)
}

/// Message type in the same dialect (prefix) as `incoming`.
pub fn reply_type(incoming: &str, family: &str, name: &str) -> String {
    let prefix = if incoming.starts_with(LEGACY_PREFIX) {
        LEGACY_PREFIX
    } else {
        DIDCOMM_PREFIX
    };
    message_type(prefix, family, name)
}

/// Split a message type into its protocol URI and message name.
pub fn split_type(type_: &str) -> Option<(&str, &str)> {
    type_
        .rsplit_once('/')
        .filter(|(protocol, name)| !protocol.is_empty() && !name.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

/// One plaintext DIDComm message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub type_: String,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Payload {
    /// New message with a fresh id. `thread_id` of `None` starts a thread
    /// whose id is the message id.
    pub fn new(type_: impl Into<String>, thread_id: Option<&str>) -> Self {
        let mut payload = Self {
            id: uuid::Uuid::new_v4().to_string(),
            type_: type_.into(),
            thread: None,
            body: Map::new(),
        };
        if let Some(thid) = thread_id {
            payload.set_thread_id(thid);
        }
        payload
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let payload: Self = serde_json::from_slice(bytes)?;
        if split_type(&payload.type_).is_none() {
            return Err(ProtocolError::Validation(format!(
                "message type '{}' has no protocol",
                payload.type_
            )));
        }
        Ok(payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Thread id, falling back to the message id for the first message.
    pub fn thread_id(&self) -> &str {
        self.thread
            .as_ref()
            .and_then(|t| t.thid.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn set_thread_id(&mut self, thid: impl Into<String>) {
        self.thread.get_or_insert_with(Thread::default).thid = Some(thid.into());
    }

    /// Protocol URI part of the type.
    pub fn protocol(&self) -> &str {
        split_type(&self.type_).map(|(p, _)| p).unwrap_or(&self.type_)
    }

    /// Message name part of the type.
    pub fn message_name(&self) -> &str {
        split_type(&self.type_).map(|(_, n)| n).unwrap_or_default()
    }

    /// Decode the body into a protocol message.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    /// Replace the body with a serialized protocol message.
    pub fn set_body<T: Serialize>(&mut self, body: &T) -> Result<()> {
        match serde_json::to_value(body)? {
            Value::Object(map) => {
                self.body = map;
                Ok(())
            }
            other => Err(ProtocolError::Invariant(format!(
                "message body must be an object, got {}",
                other
            ))),
        }
    }

    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.set_body(body)?;
        Ok(self)
    }
}
