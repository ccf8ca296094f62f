//! Basic message protocol (`basicmessage/1.0`).
//!
//! One-shot text messages over an established pairwise relationship.
//! Both ends keep the message in a [`BasicMessageRep`].

use crate::agent::Agent;
use crate::engine::{exec_psm, Transition};
use crate::payload::{message_type, protocol_uri, Payload, DIDCOMM_PREFIX, LEGACY_PREFIX};
use crate::processor::{Handler, Processor, ProcessorRegistry};
use crate::status::{BasicMessageStatus, StatusDetails};
use crate::task::{task_as, ProtocolStart, Role, Task, TaskBase, TaskHeader};
use crate::{Packet, ProtocolError, Result};
use dca_psm::{decode, encode, Rep, RepRegistry, StateKey};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub const FAMILY: &str = "basicmessage/1.0";
pub const BASIC_MESSAGE_TAG: u8 = 2;

const MESSAGE: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicMessageStart {
    pub connection_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct BasicMessageTask {
    pub header: TaskHeader,
    pub message: BasicMessageStart,
}

impl Task for BasicMessageTask {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageBody {
    content: String,
    #[serde(default)]
    sent_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicMessageRep {
    pub key: StateKey,
    pub connection_id: String,
    pub content: String,
    pub sent_time: String,
    pub sent_by_me: bool,
}

impl BasicMessageRep {
    pub fn decode(bytes: &[u8]) -> dca_psm::Result<Box<dyn Rep>> {
        Ok(Box::new(decode::<Self>(bytes)?))
    }
}

impl Rep for BasicMessageRep {
    fn key(&self) -> &StateKey {
        &self.key
    }
    fn tag(&self) -> u8 {
        BASIC_MESSAGE_TAG
    }
    fn data(&self) -> dca_psm::Result<Vec<u8>> {
        encode(self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn register(processors: &ProcessorRegistry, reps: &RepRegistry) {
    reps.add(BASIC_MESSAGE_TAG, BasicMessageRep::decode);
    processors.add(
        &[
            protocol_uri(DIDCOMM_PREFIX, FAMILY),
            protocol_uri(LEGACY_PREFIX, FAMILY),
        ],
        Processor {
            family: FAMILY,
            creator: create,
            starter: start,
            handlers: HashMap::from([(MESSAGE, message as Handler)]),
            continuator: None,
            fill_status: Some(fill_status),
        },
    );
}

fn create(header: TaskHeader, start: Option<&ProtocolStart>) -> Result<Box<dyn Task>> {
    match start {
        Some(ProtocolStart::BasicMessage(message)) => Ok(Box::new(BasicMessageTask {
            header,
            message: message.clone(),
        })),
        _ => Err(ProtocolError::Validation("basic message needs content and a connection".into())),
    }
}

fn start(agent: Arc<Agent>, task: Box<dyn Task>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let task = task_as::<BasicMessageTask>(task.as_ref())?;
        let pipe = agent.pipe(&task.message.connection_id)?;
        let pairwise = pipe.local.as_ref().map(|local| local.did.clone());
        let me = agent.did().to_string();
        let key = StateKey::new(&me, task.id());
        let engine = agent.engine();
        let _guard = engine.lock(&key).await;

        let body = MessageBody {
            content: task.message.content.clone(),
            sent_time: chrono::Utc::now().to_rfc3339(),
        };
        let opl = Payload::new(message_type(DIDCOMM_PREFIX, FAMILY, MESSAGE), Some(task.id())).with_body(&body)?;
        agent.store().add_rep(&BasicMessageRep {
            key: key.clone(),
            connection_id: task.message.connection_id.clone(),
            content: body.content,
            sent_time: body.sent_time,
            sent_by_me: true,
        })?;

        engine
            .record_sending(&me, pairwise.as_deref(), task, &opl, None)
            .await?;
        agent.send(&pipe, &opl).await?;
        engine.after_send(&me, pairwise.as_deref(), task, &opl, None).await?;
        info!(key = %key, "basic message sent");
        Ok(())
    })
}

fn message(packet: Packet) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let body: MessageBody = packet.payload.body_as()?;
        let agent = packet.receiver.clone();
        let thread = packet.payload.thread_id().to_string();
        let key = StateKey::new(agent.did(), &thread);
        let task = TaskBase::new(TaskHeader::new(&thread, packet.payload.protocol(), Role::Addressee));

        exec_psm(Transition {
            packet,
            send_next: None,
            waiting_next: None,
            task: Box::new(task),
            in_out: Box::new(move |connection_id, _, _| {
                agent.store().add_rep(&BasicMessageRep {
                    key,
                    connection_id: connection_id.to_string(),
                    content: body.content,
                    sent_time: body.sent_time,
                    sent_by_me: false,
                })?;
                info!(connection_id, "basic message received");
                Ok(true)
            }),
        })
        .await
    })
}

fn fill_status(agent: &Agent, key: &StateKey) -> Result<StatusDetails> {
    let rep: BasicMessageRep = agent.store().get_rep_as(BASIC_MESSAGE_TAG, key)?;
    Ok(StatusDetails::BasicMessage(BasicMessageStatus {
        connection_id: rep.connection_id,
        content: rep.content,
        sent_by_me: rep.sent_by_me,
        sent_time: rep.sent_time,
    }))
}
