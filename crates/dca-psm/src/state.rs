//! Protocol state machine records.

use crate::{PsmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one conversation owned by one of our DIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub did: String,
    pub nonce: String,
}

impl StateKey {
    pub fn new(did: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            nonce: nonce.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.did, self.nonce)
    }
}

/// Which side of the protocol we play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Addressee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("INITIATOR"),
            Role::Addressee => f.write_str("ADDRESSEE"),
        }
    }
}

/// Kind of a recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Received,
    Sending,
    /// Waiting for the peer or for a user decision.
    Waiting,
    ReadyAck,
    Failure,
    Nack,
}

impl Direction {
    pub fn is_terminal(self) -> bool {
        matches!(self, Direction::ReadyAck | Direction::Failure | Direction::Nack)
    }

    /// Report whether `self` may be recorded after `prev`.
    ///
    /// `None` means the conversation has no transitions yet.
    pub fn can_follow(self, prev: Option<Direction>) -> bool {
        use Direction::*;
        match prev {
            None => matches!(self, Received | Sending | Waiting | Failure | Nack),
            Some(prev) if prev.is_terminal() => false,
            Some(_) if matches!(self, Failure | Nack) => true,
            Some(Received) => matches!(self, Sending | ReadyAck | Waiting),
            Some(Sending) => matches!(self, Waiting | ReadyAck),
            Some(Waiting) => matches!(self, Received | Sending | ReadyAck),
            Some(_) => false,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Received => "Received",
            Direction::Sending => "Sending",
            Direction::Waiting => "Waiting",
            Direction::ReadyAck => "ReadyACK",
            Direction::Failure => "Failure",
            Direction::Nack => "NACK",
        };
        f.write_str(name)
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubState {
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub direction: Direction,
    /// Full type URI of the message the transition is about.
    pub message_type: String,
    pub payload_id: String,
    /// Set on `Sending` so the message can go out again after a failed
    /// send or a restart.
    #[serde(default)]
    pub outbound: Option<Outbound>,
}

/// Serialized outbound message of a `Sending` transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub payload: Vec<u8>,
    /// Message type awaited once the send succeeds; `None` finishes the
    /// conversation.
    pub waiting_next: Option<String>,
}

impl SubState {
    pub fn new(direction: Direction, message_type: impl Into<String>, payload_id: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            direction,
            message_type: message_type.into(),
            payload_id: payload_id.into(),
            outbound: None,
        }
    }

    pub fn with_outbound(mut self, outbound: Outbound) -> Self {
        self.outbound = Some(outbound);
        self
    }
}

/// Transition log of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Psm {
    pub key: StateKey,
    pub role: Role,
    /// Protocol URI, e.g. `https://didcomm.org/connections/1.0`.
    pub protocol: String,
    /// Our pairwise DID once the relationship exists.
    #[serde(default)]
    pub pairwise_did: Option<String>,
    pub states: Vec<SubState>,
}

impl Psm {
    pub fn new(key: StateKey, role: Role, protocol: impl Into<String>) -> Self {
        Self {
            key,
            role,
            protocol: protocol.into(),
            pairwise_did: None,
            states: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&SubState> {
        self.states.last()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.last().map(|s| s.direction)
    }

    /// Append a transition if it is a legal successor of the current state.
    pub fn append(&mut self, state: SubState) -> Result<()> {
        let from = self.direction();
        if !state.direction.can_follow(from) {
            return Err(PsmError::IllegalTransition {
                key: self.key.clone(),
                from,
                to: state.direction,
            });
        }
        self.states.push(state);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.direction() == Some(Direction::ReadyAck)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.direction(), Some(Direction::Failure | Direction::Nack))
    }

    pub fn is_terminal(&self) -> bool {
        self.direction().is_some_and(Direction::is_terminal)
    }

    /// The conversation is parked until a user decides how to continue.
    pub fn is_waiting(&self) -> bool {
        self.direction() == Some(Direction::Waiting)
    }

    /// Check that every transition is a legal successor of the one before.
    pub fn is_legal_path(&self) -> bool {
        let mut prev = None;
        for state in &self.states {
            if !state.direction.can_follow(prev) {
                return false;
            }
            prev = Some(state.direction);
        }
        true
    }
}
