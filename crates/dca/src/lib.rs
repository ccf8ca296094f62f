//! # DIDComm agent core
//!
//! Protocol state machines for DIDComm agents, run over secure pipes and
//! persisted as append-only transition logs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dca::{Agent, AgentConfig, AgentParts, HttpTransport, HttpTransportConfig, IdentityKey, Wallet};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (processors, reps) = dca::registries();
//! let agent = Agent::new(
//!     AgentConfig::default(),
//!     IdentityKey::generate(),
//!     AgentParts {
//!         wallet: Arc::new(Wallet::new()),
//!         store: Arc::new(dca::Store::open("agent.db", reps)?),
//!         processors,
//!         transport: Arc::new(HttpTransport::new(HttpTransportConfig::default())?),
//!     },
//! );
//! println!("DID: {}", agent.did());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`core`] - DIDs, keys, wallet and transport addresses
//! - [`pipe`] - Secure pipes and envelope packing
//! - [`psm`] - Transition logs, representatives and the store
//! - [`protocol`] - Engine, router and the built-in protocols

pub use dca_core as core;
pub use dca_pipe as pipe;
pub use dca_protocol as protocol;
pub use dca_psm as psm;

// Re-export common types at root
pub use dca_core::{Addr, Did, Identity, IdentityKey, ServiceAddr, Wallet};
pub use dca_protocol::{
    Agent, AgentConfig, AgentParts, HttpTransport, HttpTransportConfig, LoopbackTransport, Packet,
    PacketRouter, Payload, ProcessorRegistry, ProtocolError, ProtocolStart, ProtocolStatus, Result,
    Role, StatusEvent, StatusSubscription, Transport, TransportError,
};
pub use dca_psm::{Direction, Psm, RepRegistry, StateKey, Store};

use std::sync::Arc;

/// Register every built-in protocol and representative.
pub fn register_all(processors: &ProcessorRegistry, reps: &RepRegistry) {
    dca_protocol::connection::register(processors, reps);
    dca_protocol::trust_ping::register(processors);
    dca_protocol::basic_message::register(processors, reps);
}

/// Fresh registries with every built-in protocol registered.
pub fn registries() -> (Arc<ProcessorRegistry>, Arc<RepRegistry>) {
    let processors = ProcessorRegistry::new();
    let reps = RepRegistry::new();
    register_all(&processors, &reps);
    (Arc::new(processors), Arc::new(reps))
}
