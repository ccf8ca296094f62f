//! Connection protocol processor.

use super::messages::{Connection, Invitation, Request, Response};
use super::rep::{DidRep, PairwiseRep, PAIRWISE_TAG};
use super::signature;
use crate::agent::Agent;
use crate::payload::{protocol_uri, reply_type, Payload, DIDCOMM_PREFIX, LEGACY_PREFIX};
use crate::processor::{Handler, Processor, ProcessorRegistry};
use crate::status::{ConnectionStatus, StatusDetails};
use crate::task::{task_as, ProtocolStart, Role, Task, TaskBase, TaskHeader};
use crate::{Packet, ProtocolError, Result};
use dca_core::keys::decode_verkey;
use dca_core::{Identity, ServiceAddr};
use dca_pipe::Pipe;
use dca_psm::{Direction, RepRegistry, StateKey};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const FAMILY: &str = "connections/1.0";

const REQUEST: &str = "request";
const RESPONSE: &str = "response";

/// Connection run started from an invitation.
#[derive(Debug, Clone)]
pub struct ConnectionTask {
    pub header: TaskHeader,
    pub invitation: Invitation,
    /// Our label sent to the other end.
    pub label: String,
}

impl Task for ConnectionTask {
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

/// Register the processor under both protocol URIs and its representative.
pub fn register(processors: &ProcessorRegistry, reps: &RepRegistry) {
    reps.add(PAIRWISE_TAG, PairwiseRep::decode);
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
                (REQUEST, request as Handler),
                (RESPONSE, response as Handler),
            ]),
            continuator: None,
            fill_status: Some(fill_status),
        },
    );
}

fn create(mut header: TaskHeader, start: Option<&ProtocolStart>) -> Result<Box<dyn Task>> {
    let (invitation, label) = match start {
        Some(ProtocolStart::Connection { invitation, label }) => (invitation, label),
        _ => {
            return Err(ProtocolError::Validation(
                "connection needs an invitation to start".into(),
            ))
        }
    };
    invitation.validate()?;
    // Parsing accepts any key string; a run can only start with a usable one.
    decode_verkey(invitation.recipient_key()?)
        .map_err(|e| ProtocolError::Validation(format!("invitation recipient key: {}", e)))?;
    header.task_id = invitation.id.clone();
    header.receiver = ServiceAddr::new(
        invitation.service_endpoint.clone(),
        invitation.recipient_key()?,
    );
    info!(invitation = %invitation.id, "connection task created");
    Ok(Box::new(ConnectionTask {
        header,
        invitation: invitation.clone(),
        label: label.clone(),
    }))
}

fn start(agent: Arc<Agent>, task: Box<dyn Task>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move { start_connection(agent, task).await })
}

fn request(packet: Packet) -> BoxFuture<'static, Result<()>> {
    Box::pin(handle_request(packet))
}

fn response(packet: Packet) -> BoxFuture<'static, Result<()>> {
    Box::pin(handle_response(packet))
}

async fn start_connection(agent: Arc<Agent>, task: Box<dyn Task>) -> Result<()> {
    let task = task_as::<ConnectionTask>(task.as_ref())?;
    let me = agent.did().to_string();
    let key = StateKey::new(&me, task.id());
    let engine = agent.engine();
    let _guard = engine.lock(&key).await;

    if task.role() == Role::Addressee {
        // We handed out the invitation and wait for the request.
        let wpl = Payload::new(reply_type(&task.invitation.type_, FAMILY, REQUEST), Some(task.id()));
        engine.update_psm(&me, None, task, &wpl, Direction::Waiting).await?;
        return Ok(());
    }

    let caller = agent.new_pairwise_identity()?;
    let endpoint = agent.pairwise_endpoint(&caller);
    let request = Request {
        label: task.label.clone(),
        connection: Connection::new(&caller, &endpoint),
    };
    let opl = Payload::new(reply_type(&task.invitation.type_, FAMILY, REQUEST), Some(task.id()))
        .with_body(&request)?;

    // Until the response arrives the other end is the invitation key.
    let recipient_key = task.invitation.recipient_key()?;
    let callee = Identity::out(recipient_key, task.invitation.routing_keys.clone())
        .with_endpoint(ServiceAddr::new(task.invitation.service_endpoint.clone(), recipient_key));

    let pairwise = PairwiseRep {
        key: key.clone(),
        name: task.id().to_string(),
        their_label: task.invitation.label.clone(),
        caller: DidRep::mine(&caller, &endpoint),
        callee: DidRep::theirs(&callee),
    };
    agent.store().add_rep(&pairwise)?;

    let pipe = Pipe::new(agent.packager().clone(), caller.clone(), callee);
    agent.add_pipe(&pairwise.name, pipe.clone());

    let response_type = reply_type(&opl.type_, FAMILY, RESPONSE);
    engine
        .record_sending(&me, Some(caller.did.as_str()), task, &opl, Some(response_type.as_str()))
        .await?;
    agent.send(&pipe, &opl).await?;
    engine
        .after_send(&me, Some(caller.did.as_str()), task, &opl, Some(response_type))
        .await?;
    info!(key = %key, pairwise = %caller.did, "connection request sent");
    Ok(())
}

async fn handle_request(packet: Packet) -> Result<()> {
    let agent = packet.receiver.clone();
    let me = agent.did().to_string();
    let ipl = &packet.payload;

    // The PSM follows the thread. The pairwise is named after the
    // invitation id from the edge token when there is one, since some
    // peers use it as the connection id.
    let thread = ipl.thread_id().to_string();
    let connection_id = if packet.address.edge_token.is_empty() {
        thread.clone()
    } else {
        packet.address.edge_token.clone()
    };

    let request: Request = ipl.body_as()?;
    let caller = request.connection.their_identity()?;

    let mut task = TaskBase::new(TaskHeader::new(&thread, ipl.protocol(), Role::Addressee));
    task.header.sender = caller.endpoint.clone().unwrap_or_default();
    task.header.receiver = packet.address.to_public();

    let key = StateKey::new(&me, &thread);
    let engine = agent.engine();
    let _guard = engine.lock(&key).await;

    engine.update_psm(&me, None, &task, ipl, Direction::Received).await?;
    task.header.switch_direction();

    let callee = agent.new_pairwise_identity()?;
    let endpoint = agent.pairwise_endpoint(&callee);
    let pipe = Pipe::new(agent.packager().clone(), callee.clone(), caller.clone());
    let response = Response {
        connection_sig: signature::sign(&Connection::new(&callee, &endpoint), &pipe)?,
    };
    let opl = Payload::new(reply_type(&ipl.type_, FAMILY, RESPONSE), Some(thread.as_str())).with_body(&response)?;

    let pairwise = PairwiseRep {
        key: key.clone(),
        name: connection_id.clone(),
        their_label: request.label.clone(),
        caller: DidRep::theirs(&caller),
        callee: DidRep::mine(&callee, &endpoint),
    };
    agent.store().add_rep(&pairwise)?;
    agent.add_pipe(&connection_id, pipe.clone());

    engine
        .record_sending(&me, Some(callee.did.as_str()), &task, &opl, None)
        .await?;
    agent.send(&pipe, &opl).await?;
    engine
        .after_send(&me, Some(callee.did.as_str()), &task, &opl, None)
        .await?;
    info!(key = %key, connection_id = %connection_id, "connection response sent");
    Ok(())
}

async fn handle_response(packet: Packet) -> Result<()> {
    let agent = packet.receiver.clone();
    let me = agent.did().to_string();
    let ipl = &packet.payload;
    let key = StateKey::new(&me, ipl.thread_id());
    let task = TaskBase::new(TaskHeader::new(ipl.thread_id(), ipl.protocol(), Role::Initiator));

    let engine = agent.engine();
    let _guard = engine.lock(&key).await;

    // Unknown threads are rejected without touching the store.
    let pairwise: PairwiseRep = agent.store().get_rep_as(PAIRWISE_TAG, &key)?;

    // Nothing from the response is trusted before its signature checks out.
    let verified = ipl.body_as::<Response>().and_then(|response| {
        let connection = signature::verify(&response.connection_sig, None, agent.packager())?;
        connection.their_identity()
    });
    let callee = match verified {
        Ok(callee) => callee,
        Err(e) => {
            warn!(key = %key, error = %e, "connection response rejected");
            // A finished run keeps its outcome; the rejection is only reported.
            let finished = engine.get_psm(&key).is_ok_and(|psm| psm.is_terminal());
            if !finished {
                engine.update_psm(&me, None, &task, ipl, Direction::Failure).await?;
            }
            return Err(e);
        }
    };

    let caller_did = pairwise.caller.did.clone();
    engine.update_psm(&me, Some(caller_did.as_str()), &task, ipl, Direction::Received).await?;

    let pairwise = PairwiseRep {
        callee: DidRep::theirs(&callee),
        ..pairwise
    };
    agent.store().add_rep(&pairwise)?;

    let local = agent.wallet().identity(&caller_did)?;
    agent.add_pipe(&pairwise.name, Pipe::new(agent.packager().clone(), local, callee));

    let done = Payload::new(ipl.type_.clone(), Some(ipl.thread_id()));
    engine.update_psm(&me, Some(caller_did.as_str()), &task, &done, Direction::ReadyAck).await?;
    info!(key = %key, connection_id = %pairwise.name, "connection ready");
    Ok(())
}

fn fill_status(agent: &Agent, key: &StateKey) -> Result<StatusDetails> {
    let pairwise: PairwiseRep = agent.store().get_rep_as(PAIRWISE_TAG, key)?;
    let (mine, theirs) = (pairwise.mine(), pairwise.theirs());
    Ok(StatusDetails::Connection(ConnectionStatus {
        id: pairwise.name.clone(),
        my_did: mine.did.clone(),
        their_did: theirs.did.clone(),
        their_endpoint: theirs.endp.clone(),
        their_label: pairwise.their_label.clone(),
    }))
}
