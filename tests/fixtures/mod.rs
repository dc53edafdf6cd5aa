//! Test fixtures
//!
//! - [`ScriptedStunServer`]: loopback STUN server simulating NAT behaviors
//! - [`MemoryNetwork`]: in-process signaling between punch coordinators

mod signaling;
mod stun_server;

pub use signaling::{InboundResult, MemoryNetwork, MemorySignaling, StaticAddresses};
pub use stun_server::{ScriptedStunServer, StunScript};

/// A loopback port that was free a moment ago
///
/// Binding and dropping is racy, but the window is small enough for tests
/// that pin local ports.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .unwrap()
}
