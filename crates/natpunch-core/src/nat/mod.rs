//! NAT Classification Module
//!
//! Answers two questions about the local node:
//!
//! - **What kind of NAT is in front of us?** [`NatDetector`] runs the STUN
//!   discrimination tree and caches the [`NatType`].
//! - **Can peers reach us unsolicited?** [`ReachabilityClassifier`] folds
//!   dial-back results into a [`Reachability`] with hysteresis.
//!
//! Supporting pieces: the STUN codec and probe ([`StunClient`]), external IP
//! discovery ([`ExternalAddressResolver`]) and a port mapping registry
//! ([`PortMappingRegistry`]).
//!
//! # NAT Types
//!
//! - **None**: No NAT, direct public IP connectivity
//! - **Full Cone**: Any external host can send packets to the mapped port
//! - **Restricted Cone**: Only hosts that received packets can send back
//! - **Port Restricted Cone**: Only specific host:port pairs can send back
//! - **Symmetric**: Different external mapping for each destination

pub mod external;
pub mod portmap;
pub mod reachability;
pub mod stun;
pub mod types;

// Re-exports
pub use crate::config::{NatDetectorConfig, ReachabilityConfig, StunConfig};
pub use external::{DiscoveryError, ExternalAddressResolver, IpDiscoverer, StunIpDiscoverer};
pub use portmap::{ActiveMapping, PortMapError, PortMapper, PortMappingRegistry, Protocol};
pub use reachability::{
    DIAL_BACK_PROTOCOL, DialBackClient, DialBackOutcome, PeerDirectory, Reachability,
    ReachabilityChanged, ReachabilityClassifier, ReachabilityProber,
};
pub use stun::{
    InvalidResponse, StunAttribute, StunClient, StunError, StunMessage, StunMessageClass,
    StunMessageType, StunProbeResult,
};
pub use types::{NatDetector, NatError, NatType, local_ip_toward};
