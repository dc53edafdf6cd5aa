//! Fuzz target for UDP punch packet validation
//!
//! Splits the input into a nonce and a packet; validation must never panic
//! and must only accept packets that carry that nonce.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use natpunch_core::punch::{NONCE_LEN, validate_packet};

#[derive(Debug, Arbitrary)]
struct Input {
    nonce: [u8; NONCE_LEN],
    packet: Vec<u8>,
}

fuzz_target!(|input: Input| {
    if validate_packet(&input.packet, &input.nonce).is_some() {
        assert!(input.packet.len() >= 4 + NONCE_LEN);
        assert_eq!(&input.packet[4..4 + NONCE_LEN], &input.nonce);
    }
});
