//! Agent context.
//!
//! An [`Agent`] is one local agent identity together with everything
//! handlers need: the wallet holding its pairwise keys, the store, the
//! PSM engine, the processor registry, the outbound transport and the
//! in-memory map of established pairwise pipes.
//!
//! Pairwise keys are also written to the store so that [`Agent::restore_pipes`]
//! can bring a restarted agent back to where it stopped.

use crate::connection::{Invitation, PairwiseRep, PAIRWISE_TAG};
use crate::engine::{resend_psm, PsmEngine};
use crate::payload::Payload;
use crate::processor::ProcessorRegistry;
use crate::status::{ProtocolStatus, StatusSubscription};
use crate::task::{ProtocolStart, Role, TaskHeader};
use crate::transport::Transport;
use crate::{ProtocolError, Result};
use dca_core::{Identity, IdentityKey, ServiceAddr, Wallet};
use dca_pipe::{LocalPackager, Packager, Pipe};
use dca_psm::{downcast, Direction, StateKey, Store, PSM_BUCKET};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store bucket holding the secret seeds of our pairwise identities,
/// keyed by agent DID and pairwise DID.
pub const PAIRWISE_KEY_BUCKET: &str = "pairwise_key";

/// Agent level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// First path segment of our endpoints.
    pub service_name: String,
    /// Scheme and host peers reach us at.
    pub host_addr: String,
    /// Answer protocols that need a user decision without asking.
    pub auto_permission: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: "a2a".to_string(),
            host_addr: "http://localhost:8080".to_string(),
            auto_permission: true,
        }
    }
}

/// Shared collaborators of an agent.
pub struct AgentParts {
    pub wallet: Arc<Wallet>,
    pub store: Arc<Store>,
    pub processors: Arc<ProcessorRegistry>,
    pub transport: Arc<dyn Transport>,
}

pub struct Agent {
    config: AgentConfig,
    identity: Identity,
    wallet: Arc<Wallet>,
    packager: Arc<dyn Packager>,
    engine: PsmEngine,
    processors: Arc<ProcessorRegistry>,
    transport: Arc<dyn Transport>,
    /// Connection id to pipe.
    pipes: RwLock<HashMap<String, Pipe>>,
    /// Our pairwise DID to connection id.
    pairwise: RwLock<HashMap<String, String>>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("did", &self.identity.did)
            .field("config", &self.config)
            .field("pipes", &self.pipes.read().len())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create an agent for `key`. The key is added to the wallet.
    pub fn new(config: AgentConfig, key: IdentityKey, parts: AgentParts) -> Arc<Self> {
        let identity = parts.wallet.insert(key);
        let packager: Arc<dyn Packager> = Arc::new(LocalPackager::new(parts.wallet.clone()));
        info!(did = %identity.did, "agent created");
        Arc::new(Self {
            config,
            identity,
            wallet: parts.wallet,
            packager,
            engine: PsmEngine::new(parts.store),
            processors: parts.processors,
            transport: parts.transport,
            pipes: RwLock::new(HashMap::new()),
            pairwise: RwLock::new(HashMap::new()),
        })
    }

    pub fn did(&self) -> &str {
        &self.identity.did
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn auto_permission(&self) -> bool {
        self.config.auto_permission
    }

    pub fn engine(&self) -> &PsmEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<Store> {
        self.engine.store()
    }

    pub fn wallet(&self) -> &Arc<Wallet> {
        &self.wallet
    }

    pub fn packager(&self) -> &Arc<dyn Packager> {
        &self.packager
    }

    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    fn base(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.host_addr.trim_end_matches('/'),
            self.config.service_name,
            self.identity.did,
            self.identity.did
        )
    }

    /// Our agent level endpoint.
    pub fn endpoint(&self) -> ServiceAddr {
        ServiceAddr::new(self.base(), self.identity.verkey.clone())
    }

    /// Endpoint of one of our pairwise identities.
    pub fn pairwise_endpoint(&self, pairwise: &Identity) -> ServiceAddr {
        ServiceAddr::new(format!("{}/{}", self.base(), pairwise.did), pairwise.verkey.clone())
    }

    /// Invitation others use to connect to us. The edge token of its
    /// endpoint is the invitation id.
    pub fn create_invitation(&self, label: &str) -> Invitation {
        let id = uuid::Uuid::new_v4().to_string();
        let endpoint = format!("{}/{}/{}", self.base(), self.identity.did, id);
        Invitation::new(id, label, self.identity.verkey.clone(), endpoint)
    }

    /// Create a pairwise identity whose key outlives the process.
    ///
    /// The seed is written to the store before the key is used, so a
    /// restarted agent can still open messages addressed to it.
    pub fn new_pairwise_identity(&self) -> Result<Identity> {
        let key = IdentityKey::generate();
        let record = StateKey::new(self.did(), key.did().to_string());
        self.store().put(PAIRWISE_KEY_BUCKET, &record, &key.to_bytes())?;
        debug!(pairwise = %record.nonce, "pairwise key stored");
        Ok(self.wallet.insert(key))
    }

    /// Load the persisted pairwise keys of this agent into the wallet.
    pub fn restore_keys(&self) -> Result<usize> {
        let mut restored = 0;
        for record in self.store().keys(PAIRWISE_KEY_BUCKET)? {
            if record.did != self.identity.did || self.wallet.contains(&record.nonce) {
                continue;
            }
            let bytes = self.store().get(PAIRWISE_KEY_BUCKET, &record)?;
            let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                ProtocolError::Invariant(format!("pairwise key {} is {} bytes", record, bytes.len()))
            })?;
            self.wallet.insert(IdentityKey::from_bytes(&seed));
            restored += 1;
        }
        info!(did = %self.identity.did, restored, "pairwise keys restored");
        Ok(restored)
    }

    pub fn add_pipe(&self, connection_id: &str, pipe: Pipe) {
        if let Some(local) = &pipe.local {
            self.pairwise
                .write()
                .insert(local.did.clone(), connection_id.to_string());
        }
        debug!(connection_id, "pipe added");
        self.pipes.write().insert(connection_id.to_string(), pipe);
    }

    pub fn pipe(&self, connection_id: &str) -> Result<Pipe> {
        self.pipes
            .read()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownConnection(connection_id.to_string()))
    }

    /// Connection id and pipe of the relationship our `pairwise_did` belongs to.
    pub fn pipe_by_pairwise(&self, pairwise_did: &str) -> Result<(String, Pipe)> {
        let connection_id = self
            .pairwise
            .read()
            .get(pairwise_did)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownConnection(pairwise_did.to_string()))?;
        let pipe = self.pipe(&connection_id)?;
        Ok((connection_id, pipe))
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.pipes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pack `payload` for the pipe's remote end and post it to its endpoint.
    pub async fn send(&self, pipe: &Pipe, payload: &Payload) -> Result<()> {
        let endpoint = pipe.remote.endpoint.as_ref().ok_or_else(|| {
            ProtocolError::Invariant(format!("no endpoint for {}", pipe.remote.did))
        })?;
        let (envelope, _) = pipe.pack(&payload.to_bytes()?)?;
        debug!(endpoint = %endpoint.endp, message_type = %payload.type_, "sending");
        if let Err(e) = self.transport.send(&endpoint.endp, envelope).await {
            warn!(endpoint = %endpoint.endp, error = %e, "transport failure");
            return Err(e.into());
        }
        Ok(())
    }

    /// Start a new run of protocol `type_id` and return its state key.
    pub async fn start_protocol(
        self: &Arc<Self>,
        type_id: &str,
        role: Role,
        start: Option<ProtocolStart>,
    ) -> Result<StateKey> {
        let processor = self.processors.get(type_id)?;
        let header = TaskHeader::new(uuid::Uuid::new_v4().to_string(), type_id, role);
        let task = (processor.creator)(header, start.as_ref())?;
        let key = StateKey::new(self.did(), task.id());
        info!(key = %key, protocol = type_id, %role, "starting protocol");
        (processor.starter)(self.clone(), task).await?;
        Ok(key)
    }

    /// Resume a run that waits for a user decision.
    pub async fn continue_protocol(self: &Arc<Self>, key: &StateKey, accept: bool) -> Result<()> {
        let psm = self.engine.get_psm(key)?;
        let processor = self.processors.get(&psm.protocol)?;
        let continuator = processor.continuator.ok_or_else(|| {
            ProtocolError::Validation(format!("{} has no user actions", psm.protocol))
        })?;
        continuator(self.clone(), psm, accept).await
    }

    /// Current state of a run plus its protocol specific details.
    pub fn protocol_status(&self, key: &StateKey) -> Result<ProtocolStatus> {
        let psm = self.engine.get_psm(key)?;
        let details = match self.processors.status_provider(&psm.protocol)? {
            Some(fill_status) => match fill_status(self, key) {
                Ok(details) => Some(details),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        Ok(ProtocolStatus {
            key: psm.key.clone(),
            protocol: psm.protocol.clone(),
            role: psm.role,
            state: psm.direction(),
            details,
        })
    }

    /// Repeat the send of a run whose last transition is `Sending`.
    pub async fn resend(&self, key: &StateKey) -> Result<()> {
        resend_psm(self, key).await
    }

    /// Repeat every send of this agent that never completed, e.g. after a
    /// restart. Failures are logged and the remaining runs still resent.
    pub async fn resend_pending(&self) -> Result<usize> {
        let mut resent = 0;
        for key in self.store().keys(PSM_BUCKET)? {
            if key.did != self.identity.did {
                continue;
            }
            let psm = self.engine.get_psm(&key)?;
            if psm.direction() != Some(Direction::Sending) {
                continue;
            }
            match self.resend(&key).await {
                Ok(()) => resent += 1,
                Err(e) => warn!(key = %key, error = %e, "resend failed"),
            }
        }
        info!(did = %self.identity.did, resent, "pending sends repeated");
        Ok(resent)
    }

    pub fn subscribe(&self) -> StatusSubscription {
        self.engine.subscribe(self.did())
    }

    /// End all status streams of this agent.
    pub fn close_streams(&self) {
        self.engine.status().close_owner(self.did());
    }

    /// Rebuild the pipe map from persisted pairwise records, loading the
    /// pairwise keys first.
    ///
    /// Records whose key is missing, or whose peer is not known yet, are
    /// skipped.
    pub fn restore_pipes(&self) -> Result<usize> {
        self.restore_keys()?;
        let mut restored = 0;
        for rep in self.store().reps_by_tag(PAIRWISE_TAG)? {
            let pairwise: PairwiseRep = downcast(rep.as_ref())?;
            if pairwise.key.did != self.identity.did {
                continue;
            }
            let (mine, theirs) = (pairwise.mine(), pairwise.theirs());
            if theirs.verkey.is_empty() {
                continue;
            }
            let local = match self.wallet.identity(&mine.did) {
                Ok(local) => local,
                Err(_) => {
                    warn!(key = %pairwise.key, did = %mine.did, "pairwise key missing from wallet");
                    continue;
                }
            };
            let pipe = Pipe::new(self.packager.clone(), local, theirs.identity());
            self.add_pipe(&pairwise.name, pipe);
            restored += 1;
        }
        info!(did = %self.identity.did, restored, "pipes restored");
        Ok(restored)
    }
}
