//! Packet router.
//!
//! Inbound envelopes are journaled, unpacked with the receiving agent's
//! keys and dispatched to the handler registered for their message type.

use crate::agent::Agent;
use crate::payload::Payload;
use crate::processor::ProcessorRegistry;
use crate::{ProtocolError, Result};
use dca_core::{Addr, Identity};
use dca_pipe::Pipe;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One inbound message on its way to a handler.
#[derive(Debug, Clone)]
pub struct Packet {
    pub payload: Payload,
    /// Address the message arrived at, with the sender's verkey.
    pub address: Addr,
    pub receiver: Arc<Agent>,
}

#[derive(Debug)]
pub struct PacketRouter {
    processors: Arc<ProcessorRegistry>,
    agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl PacketRouter {
    pub fn new(processors: Arc<ProcessorRegistry>) -> Self {
        Self {
            processors,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Serve `agent` at its DID.
    pub fn register(&self, agent: Arc<Agent>) {
        self.agents.write().insert(agent.did().to_string(), agent);
    }

    pub fn agent(&self, did: &str) -> Result<Arc<Agent>> {
        self.agents
            .read()
            .get(did)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownAgent(did.to_string()))
    }

    /// Validate the address and journal the envelope.
    ///
    /// Nothing is persisted when the address is rejected.
    pub fn accept(&self, path: &str, data: &[u8]) -> Result<(Arc<Agent>, Addr)> {
        let mut addr = Addr::from_server_path(path);
        if !addr.is_valid() {
            return Err(ProtocolError::Validation(format!("invalid address '{}'", path)));
        }
        if !addr.is_encrypted() {
            return Err(ProtocolError::Validation(format!(
                "endpoint '{}' is not served",
                addr.pl_rcvr
            )));
        }
        let agent = self.agent(addr.receiver_did())?;
        addr.id = agent.store().add_raw_payload(&addr.address(), data)?;
        debug!(address = %addr, id = addr.id, bytes = data.len(), "payload journaled");
        Ok((agent, addr))
    }

    /// Accept an envelope and process it in the background.
    pub fn deliver(self: &Arc<Self>, path: &str, data: Vec<u8>) -> Result<()> {
        let (agent, addr) = self.accept(path, &data)?;
        let router = self.clone();
        tokio::spawn(async move {
            let _ = router.transport(agent, addr, data).await;
        });
        Ok(())
    }

    /// Unpack and dispatch one journaled envelope.
    ///
    /// The journal entry is removed once processing finished, whatever the
    /// outcome.
    pub async fn transport(&self, agent: Arc<Agent>, addr: Addr, data: Vec<u8>) -> Result<()> {
        let id = addr.id;
        let result = self.receive(agent.clone(), addr, &data).await;
        if let Err(e) = &result {
            error!(did = %agent.did(), id, error = %e, "packet processing failed");
        }
        agent.store().remove_raw_payload(id)?;
        result
    }

    async fn receive(&self, agent: Arc<Agent>, mut addr: Addr, data: &[u8]) -> Result<()> {
        let pipe = Pipe::new(
            agent.packager().clone(),
            agent.identity().clone(),
            Identity::new("", ""),
        );
        let (plaintext, sender) = pipe.unpack(data)?;
        addr.verkey = sender;
        let payload = Payload::from_bytes(&plaintext)?;
        info!(
            did = %agent.did(),
            message_type = %payload.type_,
            thread = %payload.thread_id(),
            "packet received"
        );
        self.process(Packet {
            payload,
            address: addr,
            receiver: agent,
        })
        .await
    }

    /// Dispatch a packet to its handler.
    pub async fn process(&self, packet: Packet) -> Result<()> {
        let handler = self.processors.handler(&packet.payload.type_)?;
        handler(packet).await
    }

    /// Re-drive envelopes that were journaled but never processed.
    pub async fn recover_pending(&self) -> Result<usize> {
        let agents: Vec<Arc<Agent>> = self.agents.read().values().cloned().collect();
        let mut stores = Vec::new();
        for agent in &agents {
            if !stores.iter().any(|s| Arc::ptr_eq(s, agent.store())) {
                stores.push(agent.store().clone());
            }
        }

        let mut recovered = 0;
        for store in stores {
            for raw in store.pending_raw_payloads()? {
                let mut addr = Addr::from_server_path(&raw.address);
                addr.id = raw.id;
                let agent = match self.agent(addr.receiver_did()) {
                    Ok(agent) => agent,
                    Err(e) => {
                        warn!(id = raw.id, address = %raw.address, error = %e, "pending payload has no agent");
                        continue;
                    }
                };
                info!(id = raw.id, address = %raw.address, "re-driving pending payload");
                let _ = self.transport(agent, addr, raw.payload).await;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
