//! # dca-pipe
//!
//! Secure pipes between two identities.
//!
//! A [`Pipe`] binds our identity to the other end's identity and exposes
//! pack, unpack, sign and verify for that direction. The cryptography itself
//! sits behind the [`Packager`] capability so the pipe never touches key
//! material directly.

pub mod error;
pub mod packager;
pub mod pipe;
pub mod stamp;

pub use error::PipeError;
pub use packager::{LocalPackager, Packager, Unpacked};
pub use pipe::Pipe;
pub use stamp::{stamp, verify_stamp, SIGNATURE_EXPIRATION_SECS};

/// Result type for dca-pipe operations.
pub type Result<T> = std::result::Result<T, PipeError>;
