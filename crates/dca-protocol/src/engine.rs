//! PSM engine.
//!
//! [`PsmEngine::update_psm`] appends one transition atomically. Multi-step
//! sequences ([`exec_psm`], [`continue_psm`] and the protocol starters)
//! hold the conversation's key lock for their whole duration so that
//! steps of one conversation never interleave. Different conversations run
//! in parallel.
//!
//! Outbound steps always persist `Sending`, message included, before the
//! network send. [`resend_psm`] repeats a send that did not complete.

use crate::payload::Payload;
use crate::status::{StatusEvent, StatusHub, StatusSubscription};
use crate::task::{Task, TaskBase, TaskHeader};
use crate::{Packet, ProtocolError, Result};
use dca_psm::{Direction, Outbound, Psm, PsmError, StateKey, Store, SubState};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// Held while a multi-step sequence runs on one conversation.
pub type KeyGuard = tokio::sync::OwnedMutexGuard<()>;

/// Transition log writer and per-conversation serialization.
#[derive(Debug)]
pub struct PsmEngine {
    store: Arc<Store>,
    locks: Mutex<HashMap<StateKey, Weak<tokio::sync::Mutex<()>>>>,
    status: StatusHub,
}

impl PsmEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            status: StatusHub::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn status(&self) -> &StatusHub {
        &self.status
    }

    /// Wait for exclusive access to one conversation.
    pub async fn lock(&self, key: &StateKey) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key.clone(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    /// Append one transition to the conversation `(owner_did, task.id())`.
    ///
    /// The PSM is created on the first transition. An illegal transition
    /// is rejected and nothing is written.
    pub async fn update_psm(
        &self,
        owner_did: &str,
        pairwise_did: Option<&str>,
        task: &dyn Task,
        payload: &Payload,
        direction: Direction,
    ) -> Result<Psm> {
        let state = SubState::new(direction, payload.type_.clone(), payload.id.clone());
        self.append(owner_did, pairwise_did, task, state).await
    }

    /// Record `Sending` together with the serialized payload so that
    /// [`resend_psm`] can repeat the send.
    pub async fn record_sending(
        &self,
        owner_did: &str,
        pairwise_did: Option<&str>,
        task: &dyn Task,
        payload: &Payload,
        waiting_next: Option<&str>,
    ) -> Result<Psm> {
        let state = SubState::new(Direction::Sending, payload.type_.clone(), payload.id.clone()).with_outbound(
            Outbound {
                payload: payload.to_bytes()?,
                waiting_next: waiting_next.map(str::to_string),
            },
        );
        self.append(owner_did, pairwise_did, task, state).await
    }

    /// Record what follows a successful send of `sent`: `Waiting` for
    /// `waiting_next`, or `ReadyAck` when nothing more is expected.
    pub async fn after_send(
        &self,
        owner_did: &str,
        pairwise_did: Option<&str>,
        task: &dyn Task,
        sent: &Payload,
        waiting_next: Option<String>,
    ) -> Result<Psm> {
        match waiting_next {
            Some(waiting) => {
                let wpl = Payload::new(waiting, Some(sent.thread_id()));
                self.update_psm(owner_did, pairwise_did, task, &wpl, Direction::Waiting)
                    .await
            }
            None => {
                self.update_psm(owner_did, pairwise_did, task, sent, Direction::ReadyAck)
                    .await
            }
        }
    }

    async fn append(
        &self,
        owner_did: &str,
        pairwise_did: Option<&str>,
        task: &dyn Task,
        state: SubState,
    ) -> Result<Psm> {
        let key = StateKey::new(owner_did, task.id());
        let (direction, timestamp) = (state.direction, state.timestamp);
        let message_type = state.message_type.clone();
        let init = Psm::new(key.clone(), task.role(), task.type_id());
        let pairwise_did = pairwise_did.map(str::to_string);

        // Commits wait for fsync, so they run on the blocking pool.
        let store = self.store.clone();
        let write_key = key.clone();
        let written = tokio::task::spawn_blocking(move || {
            store.transact_psm(
                &write_key,
                || init,
                |psm| {
                    if let Some(pairwise_did) = pairwise_did {
                        psm.pairwise_did = Some(pairwise_did);
                    }
                    psm.append(state)
                },
            )
        })
        .await
        .map_err(|e| ProtocolError::Invariant(format!("store write for {} did not finish: {}", key, e)))?;

        let psm = written.map_err(|e| {
            warn!(key = %key, %direction, error = %e, "transition rejected");
            ProtocolError::State(e)
        })?;

        info!(key = %key, %direction, %message_type, "psm transition");
        self.status.publish(StatusEvent {
            key,
            protocol: psm.protocol.clone(),
            role: psm.role,
            direction,
            message_type,
            timestamp,
        });
        Ok(psm)
    }

    pub fn get_psm(&self, key: &StateKey) -> Result<Psm> {
        Ok(self.store.get_psm(key)?)
    }

    /// Status events of every conversation owned by `owner_did`.
    pub fn subscribe(&self, owner_did: &str) -> StatusSubscription {
        self.status.subscribe(owner_did)
    }
}

/// Message handler step: `(connection_id, inbound, outbound) -> ack`.
///
/// Returning `Ok(false)` declines the message and ends the conversation
/// with a NACK transition.
pub type InOut<'a> = Box<dyn FnOnce(&str, &Payload, &mut Payload) -> Result<bool> + Send + 'a>;

/// One inbound step driven by [`exec_psm`].
pub struct Transition<'a> {
    pub packet: Packet,
    /// Type of the message to send back; `None` sends nothing.
    pub send_next: Option<String>,
    /// Type we wait for next; `None` finishes with ReadyACK.
    pub waiting_next: Option<String>,
    pub task: Box<dyn Task>,
    pub in_out: InOut<'a>,
}

/// Record an inbound message, run the handler and send the reply.
///
/// Handler failure records `Failure` and returns the error without sending.
pub async fn exec_psm(transition: Transition<'_>) -> Result<()> {
    let Transition {
        packet,
        send_next,
        waiting_next,
        task,
        in_out,
    } = transition;
    let agent = packet.receiver.clone();
    let engine = agent.engine();
    let me = agent.did().to_string();
    let im = &packet.payload;

    let key = StateKey::new(&me, task.id());
    let _guard = engine.lock(&key).await;

    let (connection_id, pipe) = agent.pipe_by_pairwise(&packet.address.rcvr_did)?;
    let pairwise = pipe.local.as_ref().map(|id| id.did.clone());
    let pairwise = pairwise.as_deref();

    engine.update_psm(&me, pairwise, task.as_ref(), im, Direction::Received).await?;

    let mut om = Payload::new(send_next.clone().unwrap_or_default(), Some(im.thread_id()));
    let ack = match in_out(&connection_id, im, &mut om) {
        Ok(ack) => ack,
        Err(e) => {
            error!(key = %key, error = %e, "handler failed");
            engine.update_psm(&me, pairwise, task.as_ref(), im, Direction::Failure).await?;
            return Err(e);
        }
    };
    if !ack {
        warn!(key = %key, "handler declined message");
        engine.update_psm(&me, pairwise, task.as_ref(), im, Direction::Nack).await?;
        return Ok(());
    }

    if send_next.is_some() {
        engine
            .record_sending(&me, pairwise, task.as_ref(), &om, waiting_next.as_deref())
            .await?;
        agent.send(&pipe, &om).await?;
        engine
            .after_send(&me, pairwise, task.as_ref(), &om, waiting_next)
            .await?;
        return Ok(());
    }

    // Nothing to send back: wait for the next message or finish.
    engine
        .after_send(&me, pairwise, task.as_ref(), im, waiting_next)
        .await?;
    Ok(())
}

/// User decision step: `(agent, psm, outbound) -> ack`.
pub type Transfer<'a> =
    Box<dyn FnOnce(&crate::Agent, &Psm, &mut Payload) -> Result<bool> + Send + 'a>;

/// Resumption of a conversation parked in `Waiting` for a user decision.
pub struct Again<'a> {
    pub agent: Arc<crate::Agent>,
    pub key: StateKey,
    /// Whether the user lets the conversation continue.
    pub accept: bool,
    pub send_next: String,
    pub waiting_next: Option<String>,
    /// Type of the NACK sent when the user declines.
    pub send_on_nack: String,
    pub transfer: Transfer<'a>,
}

/// Continue or decline a conversation parked for a user decision.
///
/// Declining (or a transfer step returning `false`) records `NACK` and
/// sends `send_on_nack` to the peer.
pub async fn continue_psm(again: Again<'_>) -> Result<()> {
    let Again {
        agent,
        key,
        accept,
        send_next,
        waiting_next,
        send_on_nack,
        transfer,
    } = again;
    let engine = agent.engine();
    let _guard = engine.lock(&key).await;

    let psm = engine.get_psm(&key)?;
    if !psm.is_waiting() {
        return Err(ProtocolError::State(PsmError::IllegalTransition {
            key,
            from: psm.direction(),
            to: Direction::Sending,
        }));
    }
    let pairwise = psm
        .pairwise_did
        .clone()
        .ok_or_else(|| ProtocolError::Invariant(format!("{} has no pairwise DID", key)))?;
    let (_, pipe) = agent.pipe_by_pairwise(&pairwise)?;
    let task = TaskBase::new(TaskHeader::new(key.nonce.clone(), psm.protocol.clone(), psm.role));

    let mut om = Payload::new(send_next, Some(key.nonce.as_str()));
    let ack = if accept {
        match transfer(&agent, &psm, &mut om) {
            Ok(ack) => ack,
            Err(e) => {
                error!(key = %key, error = %e, "user action failed");
                engine.update_psm(&key.did, Some(pairwise.as_str()), &task, &om, Direction::Failure).await?;
                return Err(e);
            }
        }
    } else {
        false
    };

    if !ack {
        info!(key = %key, "user declined, sending NACK");
        let nack = Payload::new(send_on_nack, Some(key.nonce.as_str())).with_body(&json!({
            "description": { "code": "user-declined", "en": "declined by user" }
        }))?;
        engine.update_psm(&key.did, Some(pairwise.as_str()), &task, &nack, Direction::Nack).await?;
        agent.send(&pipe, &nack).await?;
        return Ok(());
    }

    engine
        .record_sending(&key.did, Some(pairwise.as_str()), &task, &om, waiting_next.as_deref())
        .await?;
    agent.send(&pipe, &om).await?;
    engine
        .after_send(&key.did, Some(pairwise.as_str()), &task, &om, waiting_next)
        .await?;
    Ok(())
}

/// Send the message of a conversation whose last transition is `Sending`
/// again, then record what follows it.
///
/// This finishes a step whose send failed or was cut short by a restart.
/// The stored payload goes out unchanged, so the peer sees the same
/// message id and thread.
pub async fn resend_psm(agent: &crate::Agent, key: &StateKey) -> Result<()> {
    let engine = agent.engine();
    let _guard = engine.lock(key).await;

    let psm = engine.get_psm(key)?;
    let outbound = match psm.last() {
        Some(state) if state.direction == Direction::Sending => state
            .outbound
            .clone()
            .ok_or_else(|| ProtocolError::Invariant(format!("{} has no stored outbound message", key)))?,
        _ => {
            return Err(ProtocolError::State(PsmError::IllegalTransition {
                key: key.clone(),
                from: psm.direction(),
                to: Direction::Sending,
            }))
        }
    };
    let pairwise = psm
        .pairwise_did
        .clone()
        .ok_or_else(|| ProtocolError::Invariant(format!("{} has no pairwise DID", key)))?;
    let (_, pipe) = agent.pipe_by_pairwise(&pairwise)?;
    let task = TaskBase::new(TaskHeader::new(key.nonce.clone(), psm.protocol.clone(), psm.role));
    let om = Payload::from_bytes(&outbound.payload)?;

    info!(key = %key, message_type = %om.type_, "resending");
    agent.send(&pipe, &om).await?;
    engine
        .after_send(&key.did, Some(pairwise.as_str()), &task, &om, outbound.waiting_next)
        .await?;
    Ok(())
}
