//! Timestamp stamping for signed payloads.
//!
//! A stamped payload is an 8-byte big-endian Unix timestamp followed by the
//! data. Some peers write the timestamp little-endian, so verification
//! accepts that encoding when the big-endian reading is not fresh.

use crate::{PipeError, Result};

/// How long a stamped signature stays valid (10 hours).
pub const SIGNATURE_EXPIRATION_SECS: i64 = 10 * 60 * 60;

const STAMP_LEN: usize = 8;

/// Prefix `data` with `now` as big-endian seconds.
pub fn stamp(data: &[u8], now: i64) -> Vec<u8> {
    let mut stamped = Vec::with_capacity(STAMP_LEN + data.len());
    stamped.extend_from_slice(&(now as u64).to_be_bytes());
    stamped.extend_from_slice(data);
    stamped
}

/// True when `timestamp` is not in the future and at most
/// [`SIGNATURE_EXPIRATION_SECS`] old at `now`.
pub fn is_fresh(timestamp: i64, now: i64) -> bool {
    let age = now.saturating_sub(timestamp);
    (0..=SIGNATURE_EXPIRATION_SECS).contains(&age)
}

/// Check the stamp of `stamped` at `now`.
///
/// Returns the accepted timestamp and the data after the stamp.
pub fn verify_stamp(stamped: &[u8], now: i64) -> Result<(i64, &[u8])> {
    if stamped.len() < STAMP_LEN {
        return Err(PipeError::Malformed(format!(
            "stamped data is {} bytes, need at least {}",
            stamped.len(),
            STAMP_LEN
        )));
    }
    let (head, data) = stamped.split_at(STAMP_LEN);
    let mut raw = [0u8; STAMP_LEN];
    raw.copy_from_slice(head);

    let big_endian = u64::from_be_bytes(raw) as i64;
    if is_fresh(big_endian, now) {
        return Ok((big_endian, data));
    }

    let little_endian = u64::from_le_bytes(raw) as i64;
    if is_fresh(little_endian, now) {
        tracing::debug!(timestamp = little_endian, "accepted little-endian signature stamp");
        return Ok((little_endian, data));
    }

    Err(PipeError::StampExpired {
        timestamp: big_endian,
        now,
    })
}
