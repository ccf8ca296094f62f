//! Protocol status reports and status event streams.

use dca_psm::{Direction, Role, StateKey};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Status of a connection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Connection id (pairwise name).
    pub id: String,
    pub my_did: String,
    pub their_did: String,
    pub their_endpoint: String,
    pub their_label: String,
}

/// Status of a basic message run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicMessageStatus {
    pub connection_id: String,
    pub content: String,
    pub sent_by_me: bool,
    pub sent_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusDetails {
    Connection(ConnectionStatus),
    BasicMessage(BasicMessageStatus),
}

/// Status of one protocol run as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStatus {
    pub key: StateKey,
    pub protocol: String,
    pub role: Role,
    pub state: Option<Direction>,
    pub details: Option<StatusDetails>,
}

/// One appended transition, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub key: StateKey,
    pub protocol: String,
    pub role: Role,
    pub direction: Direction,
    pub message_type: String,
    pub timestamp: i64,
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<StatusEvent>)>>;

#[derive(Debug, Default)]
struct HubInner {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl HubInner {
    fn remove(&self, owner: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(owner) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subscribers.remove(owner);
            }
        }
    }
}

/// Fan-out of status events per owning DID.
#[derive(Debug, Clone, Default)]
pub struct StatusHub {
    inner: Arc<HubInner>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start receiving events for conversations owned by `owner`.
    pub fn subscribe(&self, owner: &str) -> StatusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .entry(owner.to_string())
            .or_default()
            .push((id, tx));
        StatusSubscription {
            id,
            owner: owner.to_string(),
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: StatusEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        if let Some(list) = subscribers.get_mut(&event.key.did) {
            list.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    /// End every stream of `owner`. Consumers see the end after draining
    /// already queued events.
    pub fn close_owner(&self, owner: &str) {
        self.inner.subscribers.lock().remove(owner);
    }

    pub fn subscriber_count(&self, owner: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(owner)
            .map_or(0, Vec::len)
    }
}

/// Cancellable stream of status events.
#[derive(Debug)]
pub struct StatusSubscription {
    id: u64,
    owner: String,
    rx: mpsc::UnboundedReceiver<StatusEvent>,
    hub: Weak<HubInner>,
}

impl StatusSubscription {
    /// Next event, or `None` once the stream is closed or cancelled.
    pub async fn next(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    /// Stop this stream only. Events already queued are discarded.
    pub fn cancel(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.owner, self.id);
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.owner, self.id);
        }
    }
}
