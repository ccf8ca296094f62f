//! Protocol processing for DIDComm agents.
//!
//! This crate ties the pieces together:
//!
//! - [`ProcessorRegistry`]: protocol URI to creator, starter, handlers and
//!   status provider
//! - [`PsmEngine`]: appends transitions to the per-conversation log and
//!   drives handler steps ([`exec_psm`], [`continue_psm`], [`resend_psm`])
//! - [`PacketRouter`]: accepts packed envelopes, journals them, unpacks
//!   and dispatches to the registered handler
//! - [`Agent`]: one local agent identity with its wallet, store, pipes and
//!   transport
//!
//! The concrete protocols live in [`connection`], [`trust_ping`] and
//! [`basic_message`].
//!
//! # Example
//!
//! ```no_run
//! use dca_protocol::{Agent, AgentConfig, AgentParts, HttpTransport, HttpTransportConfig, ProcessorRegistry};
//! use dca_core::{IdentityKey, Wallet};
//! use dca_psm::{RepRegistry, Store};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let processors = Arc::new(ProcessorRegistry::new());
//! let reps = Arc::new(RepRegistry::new());
//! dca_protocol::connection::register(&processors, &reps);
//!
//! let agent = Agent::new(
//!     AgentConfig::default(),
//!     IdentityKey::generate(),
//!     AgentParts {
//!         wallet: Arc::new(Wallet::new()),
//!         store: Arc::new(Store::open("agent.db", reps)?),
//!         processors,
//!         transport: Arc::new(HttpTransport::new(HttpTransportConfig::default())?),
//!     },
//! );
//! let invitation = agent.create_invitation("alice");
//! println!("{}", invitation.to_url(&agent.config().host_addr)?);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod basic_message;
pub mod connection;
pub mod engine;
pub mod error;
pub mod payload;
pub mod processor;
pub mod router;
pub mod status;
pub mod task;
pub mod transport;
pub mod trust_ping;

pub use agent::{Agent, AgentConfig, AgentParts, PAIRWISE_KEY_BUCKET};
pub use engine::{continue_psm, exec_psm, resend_psm, Again, PsmEngine, Transition};
pub use error::ProtocolError;
pub use payload::{Payload, Thread};
pub use processor::{Processor, ProcessorRegistry};
pub use router::{Packet, PacketRouter};
pub use status::{ProtocolStatus, StatusDetails, StatusEvent, StatusSubscription};
pub use task::{ProtocolStart, Role, Task, TaskBase, TaskHeader};
pub use transport::{HttpTransport, HttpTransportConfig, LoopbackTransport, Transport, TransportError};

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
