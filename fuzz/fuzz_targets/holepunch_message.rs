//! Fuzz target for hole-punch negotiation framing

#![no_main]

use libfuzzer_sys::fuzz_target;
use natpunch_core::punch::HolePunchMessage;

fuzz_target!(|data: &[u8]| {
    // Decoding is strict, so accepted input must round-trip byte for byte
    if let Ok(msg) = HolePunchMessage::decode(data) {
        let encoded = msg.encode().expect("decoded message must encode");
        assert_eq!(encoded.as_slice(), data);
    }
});
