//! Fuzz target for DID and transport address parsing.
//!
//! Server paths, client URLs and DIDs come straight from the network and
//! must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::str::FromStr;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = dca_core::Did::from_str(input);

        let addr = dca_core::Addr::from_server_path(input);
        let _ = addr.is_valid();
        let _ = addr.payload_transport_did();
        let _ = addr.address();

        if let Ok(addr) = dca_core::Addr::from_client_url(input) {
            let _ = addr.to_public();
        }
    }
});
