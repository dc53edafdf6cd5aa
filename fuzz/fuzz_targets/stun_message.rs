//! Fuzz target for STUN message decoding
//!
//! The decoder must never panic, and anything it accepts must re-encode to
//! a message that decodes to the same mapped address.

#![no_main]

use libfuzzer_sys::fuzz_target;
use natpunch_core::nat::StunMessage;

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = StunMessage::decode(data) else {
        return;
    };

    let reencoded = msg.encode();
    let again = StunMessage::decode(&reencoded).expect("re-encoded message must decode");
    assert_eq!(again.transaction_id, msg.transaction_id);
    assert_eq!(again.mapped_address(), msg.mapped_address());
});
