//! Trust ping protocol (`trust_ping/1.0`).
//!
//! Checks that an established pairwise relationship works end to end.
//! Without auto permission the addressee parks the ping until the user
//! decides; declining answers with a problem report.

use crate::agent::Agent;
use crate::engine::{continue_psm, exec_psm, Again, Transition};
use crate::payload::{message_type, protocol_uri, reply_type, Payload, DIDCOMM_PREFIX, LEGACY_PREFIX};
use crate::processor::{Handler, Processor, ProcessorRegistry};
use crate::task::{task_as, ProtocolStart, Role, Task, TaskBase, TaskHeader};
use crate::{Packet, ProtocolError, Result};
use dca_psm::{Direction, Psm, StateKey};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const FAMILY: &str = "trust_ping/1.0";

const PING: &str = "ping";
const PING_RESPONSE: &str = "ping_response";
const PROBLEM_REPORT: &str = "problem_report";

#[derive(Debug, Clone)]
pub struct TrustPingTask {
    pub header: TaskHeader,
    pub connection_id: String,
}

impl Task for TrustPingTask {
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PingBody {
    #[serde(default = "yes")]
    response_requested: bool,
}

fn yes() -> bool {
    true
}

pub fn register(processors: &ProcessorRegistry) {
    processors.add(
        &[
            protocol_uri(DIDCOMM_PREFIX, FAMILY),
            protocol_uri(LEGACY_PREFIX, FAMILY),
        ],
        Processor {
            family: FAMILY,
            creator: create,
            starter: start,
            handlers: HashMap::from([
                (PING, ping as Handler),
                (PING_RESPONSE, ping_response as Handler),
                (PROBLEM_REPORT, problem_report as Handler),
            ]),
            continuator: Some(resume),
            fill_status: None,
        },
    );
}

fn create(header: TaskHeader, start: Option<&ProtocolStart>) -> Result<Box<dyn Task>> {
    match start {
        Some(ProtocolStart::TrustPing { connection_id }) => Ok(Box::new(TrustPingTask {
            header,
            connection_id: connection_id.clone(),
        })),
        _ => Err(ProtocolError::Validation("trust ping needs a connection id".into())),
    }
}

fn start(agent: Arc<Agent>, task: Box<dyn Task>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let task = task_as::<TrustPingTask>(task.as_ref())?;
        let pipe = agent.pipe(&task.connection_id)?;
        let pairwise = pipe.local.as_ref().map(|local| local.did.clone());
        let me = agent.did().to_string();
        let key = StateKey::new(&me, task.id());
        let engine = agent.engine();
        let _guard = engine.lock(&key).await;

        let opl = Payload::new(message_type(DIDCOMM_PREFIX, FAMILY, PING), Some(task.id()))
            .with_body(&PingBody {
                response_requested: true,
            })?;
        let reply = message_type(DIDCOMM_PREFIX, FAMILY, PING_RESPONSE);
        engine
            .record_sending(&me, pairwise.as_deref(), task, &opl, Some(reply.as_str()))
            .await?;
        agent.send(&pipe, &opl).await?;
        engine
            .after_send(&me, pairwise.as_deref(), task, &opl, Some(reply))
            .await?;
        info!(key = %key, connection_id = %task.connection_id, "ping sent");
        Ok(())
    })
}

fn ping(packet: Packet) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let body: PingBody = packet.payload.body_as()?;
        let thread = packet.payload.thread_id().to_string();
        let task = TaskBase::new(TaskHeader::new(&thread, packet.payload.protocol(), Role::Addressee));
        let reply = reply_type(&packet.payload.type_, FAMILY, PING_RESPONSE);

        let (send_next, waiting_next) = match (body.response_requested, packet.receiver.auto_permission()) {
            (false, _) => (None, None),
            (true, true) => (Some(reply), None),
            (true, false) => (None, Some(reply)),
        };
        exec_psm(Transition {
            packet,
            send_next,
            waiting_next,
            task: Box::new(task),
            in_out: Box::new(|connection_id, im, _| {
                debug!(connection_id, ping = %im.id, "ping received");
                Ok(true)
            }),
        })
        .await
    })
}

/// Resume a parked ping with the user's decision.
fn resume(agent: Arc<Agent>, psm: Psm, accept: bool) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let waiting_for = psm
            .last()
            .map(|state| state.message_type.clone())
            .unwrap_or_else(|| message_type(DIDCOMM_PREFIX, FAMILY, PING_RESPONSE));
        continue_psm(Again {
            agent,
            key: psm.key.clone(),
            accept,
            send_on_nack: reply_type(&waiting_for, FAMILY, PROBLEM_REPORT),
            send_next: waiting_for,
            waiting_next: None,
            transfer: Box::new(|_, _, _| Ok(true)),
        })
        .await
    })
}

/// Finish our own run on an answer from the other end.
async fn finish(packet: Packet, direction: Direction) -> Result<()> {
    let agent = packet.receiver.clone();
    let me = agent.did().to_string();
    let ipl = &packet.payload;
    let key = StateKey::new(&me, ipl.thread_id());
    let engine = agent.engine();
    let _guard = engine.lock(&key).await;

    let psm = engine.get_psm(&key)?;
    let task = TaskBase::new(TaskHeader::new(ipl.thread_id(), psm.protocol.clone(), psm.role));
    let pairwise = Some(packet.address.rcvr_did.as_str()).filter(|did| !did.is_empty());

    if direction == Direction::Nack {
        engine.update_psm(&me, pairwise, &task, ipl, Direction::Nack).await?;
        info!(key = %key, "ping declined by the other end");
        return Ok(());
    }
    engine.update_psm(&me, pairwise, &task, ipl, Direction::Received).await?;
    engine.update_psm(&me, pairwise, &task, ipl, Direction::ReadyAck).await?;
    info!(key = %key, "ping answered");
    Ok(())
}

fn ping_response(packet: Packet) -> BoxFuture<'static, Result<()>> {
    Box::pin(finish(packet, Direction::ReadyAck))
}

fn problem_report(packet: Packet) -> BoxFuture<'static, Result<()>> {
    Box::pin(finish(packet, Direction::Nack))
}
