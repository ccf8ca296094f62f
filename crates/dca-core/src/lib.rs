//! # dca-core
//!
//! Core identity primitives for the DIDComm agent.
//!
//! This crate provides:
//! - Pairwise DID syntax and parsing
//! - Ed25519 identity keys and their public descriptions
//! - The agent wallet used as key-management lookup
//! - Transport address encoding and decoding

pub mod address;
pub mod did;
pub mod error;
pub mod keys;
pub mod wallet;

pub use address::{Addr, ServiceAddr};
pub use did::{is_did, Did};
pub use error::Error;
pub use keys::{Identity, IdentityKey};
pub use wallet::{KeyLookup, Wallet};

/// Result type for dca-core operations.
pub type Result<T> = std::result::Result<T, Error>;
