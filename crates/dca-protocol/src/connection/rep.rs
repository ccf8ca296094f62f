//! Pairwise representative of a connection run.

use dca_core::{Identity, ServiceAddr};
use dca_psm::{decode, encode, Rep, StateKey};
use serde::{Deserialize, Serialize};
use std::any::Any;

pub const PAIRWISE_TAG: u8 = 1;

/// One end of the pairwise relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidRep {
    pub did: String,
    pub verkey: String,
    pub endp: String,
    pub route: Vec<String>,
    /// This end is ours.
    pub my: bool,
}

impl DidRep {
    pub fn mine(identity: &Identity, endpoint: &ServiceAddr) -> Self {
        Self {
            did: identity.did.clone(),
            verkey: identity.verkey.clone(),
            endp: endpoint.endp.clone(),
            route: identity.route.clone(),
            my: true,
        }
    }

    pub fn theirs(identity: &Identity) -> Self {
        Self {
            did: identity.did.clone(),
            verkey: identity.verkey.clone(),
            endp: identity
                .endpoint
                .as_ref()
                .map(|e| e.endp.clone())
                .unwrap_or_default(),
            route: identity.route.clone(),
            my: false,
        }
    }

    /// Public identity, with endpoint when one is known.
    pub fn identity(&self) -> Identity {
        let identity = Identity::new(self.did.clone(), self.verkey.clone()).with_route(self.route.clone());
        if self.endp.is_empty() {
            identity
        } else {
            identity.with_endpoint(ServiceAddr::new(self.endp.clone(), self.verkey.clone()))
        }
    }
}

/// Pairwise data of one connection run.
///
/// The initiator is the caller and the addressee the callee; `my` marks
/// which of the two is us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseRep {
    pub key: StateKey,
    /// Connection id.
    pub name: String,
    pub their_label: String,
    pub caller: DidRep,
    pub callee: DidRep,
}

impl PairwiseRep {
    pub fn mine(&self) -> &DidRep {
        if self.caller.my {
            &self.caller
        } else {
            &self.callee
        }
    }

    pub fn theirs(&self) -> &DidRep {
        if self.caller.my {
            &self.callee
        } else {
            &self.caller
        }
    }

    pub fn decode(bytes: &[u8]) -> dca_psm::Result<Box<dyn Rep>> {
        Ok(Box::new(decode::<Self>(bytes)?))
    }
}

impl Rep for PairwiseRep {
    fn key(&self) -> &StateKey {
        &self.key
    }
    fn tag(&self) -> u8 {
        PAIRWISE_TAG
    }
    fn data(&self) -> dca_psm::Result<Vec<u8>> {
        encode(self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
