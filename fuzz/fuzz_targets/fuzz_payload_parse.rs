//! Fuzz target for inbound message and invitation decoding.

#![no_main]

use dca_protocol::connection::{Invitation, Request, Response};
use dca_protocol::Payload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = Payload::from_bytes(data) {
        let _ = payload.thread_id();
        let _ = payload.protocol();
        let _ = payload.message_name();
        let _ = payload.body_as::<Request>();
        let _ = payload.body_as::<Response>();
    }

    if let Ok(input) = std::str::from_utf8(data) {
        let _ = Invitation::translate(input);
        let _ = Invitation::from_url(input);
    }
});
