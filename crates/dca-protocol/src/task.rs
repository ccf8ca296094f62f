//! Tasks: the in-memory description of one protocol run.
//!
//! A task is rebuilt for every inbound or outbound message from wire data
//! or persisted state and is never stored itself.

use crate::basic_message::BasicMessageStart;
use crate::connection::Invitation;
use dca_core::ServiceAddr;
pub use dca_psm::Role;
use std::any::Any;
use std::fmt;

/// Fields shared by all tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHeader {
    /// Thread id of the conversation; the nonce of its state key.
    pub task_id: String,
    /// Protocol URI, e.g. `https://didcomm.org/connections/1.0`.
    pub type_id: String,
    pub role: Role,
    pub sender: ServiceAddr,
    pub receiver: ServiceAddr,
}

impl TaskHeader {
    pub fn new(task_id: impl Into<String>, type_id: impl Into<String>, role: Role) -> Self {
        Self {
            task_id: task_id.into(),
            type_id: type_id.into(),
            role,
            sender: ServiceAddr::default(),
            receiver: ServiceAddr::default(),
        }
    }

    /// Swap sender and receiver, e.g. when answering a message.
    pub fn switch_direction(&mut self) {
        std::mem::swap(&mut self.sender, &mut self.receiver);
    }
}

/// Protocol run in progress.
pub trait Task: fmt::Debug + Send + Sync {
    fn header(&self) -> &TaskHeader;
    fn header_mut(&mut self) -> &mut TaskHeader;
    fn as_any(&self) -> &dyn Any;

    fn id(&self) -> &str {
        &self.header().task_id
    }

    fn type_id(&self) -> &str {
        &self.header().type_id
    }

    fn role(&self) -> Role {
        self.header().role
    }
}

/// Task without protocol specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBase {
    pub header: TaskHeader,
}

impl TaskBase {
    pub fn new(header: TaskHeader) -> Self {
        Self { header }
    }
}

impl Task for TaskBase {
    fn header(&self) -> &TaskHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut TaskHeader {
        &mut self.header
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Caller supplied data for starting a protocol.
#[derive(Debug, Clone)]
pub enum ProtocolStart {
    Connection { invitation: Invitation, label: String },
    TrustPing { connection_id: String },
    BasicMessage(BasicMessageStart),
}

/// Downcast a task to the concrete type a starter expects.
pub fn task_as<T: Task + 'static>(task: &dyn Task) -> crate::Result<&T> {
    task.as_any().downcast_ref::<T>().ok_or_else(|| {
        crate::ProtocolError::Invariant(format!(
            "task {} is not a {}",
            task.id(),
            std::any::type_name::<T>()
        ))
    })
}
