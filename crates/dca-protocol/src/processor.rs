//! Protocol processor registry.
//!
//! Maps protocol URIs to the functions that create tasks, start runs,
//! handle inbound messages, resume parked runs and report status. One
//! [`Processor`] may be registered under several URIs when a protocol is
//! known by more than one name.

use crate::agent::Agent;
use crate::payload::split_type;
use crate::status::StatusDetails;
use crate::task::{ProtocolStart, Task, TaskHeader};
use crate::{Packet, ProtocolError, Result};
use dca_psm::{Psm, StateKey};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Build the task for a new run.
pub type Creator = fn(TaskHeader, Option<&ProtocolStart>) -> Result<Box<dyn Task>>;

/// Send the first message of a run (or record that we wait for one).
pub type Starter = fn(Arc<Agent>, Box<dyn Task>) -> BoxFuture<'static, Result<()>>;

/// Handle one inbound message type.
pub type Handler = fn(Packet) -> BoxFuture<'static, Result<()>>;

/// Resume a run parked for a user decision; the flag is the decision.
pub type Continuator = fn(Arc<Agent>, Psm, bool) -> BoxFuture<'static, Result<()>>;

/// Protocol specific status of a run.
pub type FillStatus = fn(&Agent, &StateKey) -> Result<StatusDetails>;

/// Everything the engine needs to drive one protocol.
#[derive(Clone)]
pub struct Processor {
    /// Protocol family, e.g. `connections/1.0`.
    pub family: &'static str,
    pub creator: Creator,
    pub starter: Starter,
    /// Message name to handler.
    pub handlers: HashMap<&'static str, Handler>,
    pub continuator: Option<Continuator>,
    pub fill_status: Option<FillStatus>,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("Processor")
            .field("family", &self.family)
            .field("handlers", &handlers)
            .field("continuator", &self.continuator.is_some())
            .field("fill_status", &self.fill_status.is_some())
            .finish()
    }
}

/// Protocol URI to processor table.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` under every URI in `type_ids`.
    pub fn add(&self, type_ids: &[String], processor: Processor) {
        let processor = Arc::new(processor);
        let mut processors = self.processors.write();
        for type_id in type_ids {
            processors.insert(type_id.clone(), processor.clone());
        }
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.processors.read().contains_key(type_id)
    }

    pub fn get(&self, type_id: &str) -> Result<Arc<Processor>> {
        self.processors
            .read()
            .get(type_id)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownProtocol(type_id.to_string()))
    }

    pub fn creator(&self, type_id: &str) -> Result<Creator> {
        Ok(self.get(type_id)?.creator)
    }

    pub fn starter(&self, type_id: &str) -> Result<Starter> {
        Ok(self.get(type_id)?.starter)
    }

    pub fn status_provider(&self, type_id: &str) -> Result<Option<FillStatus>> {
        Ok(self.get(type_id)?.fill_status)
    }

    /// Handler for a full message type URI.
    pub fn handler(&self, message_type: &str) -> Result<Handler> {
        let (protocol, name) = split_type(message_type)
            .ok_or_else(|| ProtocolError::UnknownProtocol(message_type.to_string()))?;
        let processor = self.get(protocol)?;
        processor
            .handlers
            .get(name)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownMessage {
                protocol: protocol.to_string(),
                message: name.to_string(),
            })
    }
}
