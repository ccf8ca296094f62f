//! Connection protocol (`connections/1.0`).
//!
//! Two agents exchange pairwise DIDs: the initiator answers an
//! invitation with a request carrying its new pairwise DID document, the
//! addressee replies with a response whose connection data is signed and
//! timestamped by its own new pairwise key.

mod messages;
mod protocol;
mod rep;
pub mod signature;

pub use messages::{Connection, DidDoc, DidService, Invitation, PublicKey, Request, Response};
pub use protocol::{register, ConnectionTask, FAMILY};
pub use rep::{DidRep, PairwiseRep, PAIRWISE_TAG};
pub use signature::ConnectionSignature;
