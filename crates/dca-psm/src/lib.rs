//! # dca-psm
//!
//! Persistent protocol state machines.
//!
//! Every protocol conversation is keyed by a [`StateKey`] (our DID plus
//! the thread nonce) and recorded as an append-only list of [`SubState`]
//! transitions in a [`Psm`]. Protocol specific data lives next to it as
//! representatives ([`Rep`]) decoded through an injectable [`RepRegistry`].
//! Both are persisted by the SQLite backed [`Store`].

pub mod error;
pub mod rep;
pub mod state;
pub mod store;

pub use error::PsmError;
pub use rep::{decode, downcast, encode, Rep, RepDecoder, RepRegistry};
pub use state::{Direction, Outbound, Psm, Role, StateKey, SubState};
pub use store::{RawPayload, Store, PSM_BUCKET};

/// Result type for dca-psm operations.
pub type Result<T> = std::result::Result<T, PsmError>;
