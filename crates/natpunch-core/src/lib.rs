//! # natpunch core
//!
//! NAT classification and hole punching for peer-to-peer networking.
//!
//! This crate provides:
//! - A STUN (RFC 5389 subset) codec and Binding probe
//! - RFC 3489-style NAT type detection with a TTL cache
//! - A confidence-based reachability classifier fed by dial-back probes
//! - A hole-punch coordinator that negotiates candidate addresses over an
//!   existing signaling stream and drives simultaneous UDP and TCP dials
//!
//! ## Punching
//!
//! Both peers exchange their observed addresses (`Connect`), rendezvous on a
//! `Sync` round trip and then dial every candidate at the same time. The
//! outcome is best-effort: `PunchError::is_expected()` tells a caller to fall
//! back to the relay instead of treating the failure as fatal.
//!
//! ## Example
//!
//! ```rust,no_run
//! use natpunch_core::nat::{NatDetector, NatDetectorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = "198.51.100.7:3478".parse()?;
//! let detector = NatDetector::new(server, NatDetectorConfig::default());
//!
//! let cancel = CancellationToken::new();
//! let nat_type = detector.detect(&cancel).await?;
//! println!("NAT type: {nat_type}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod nat;
pub mod peer;
pub mod punch;

// Re-export commonly used types
pub use config::{ConfigError, TraversalConfig};
pub use nat::{
    NatDetector, NatError, NatType, Reachability, ReachabilityClassifier, StunClient, StunError,
    StunProbeResult,
};
pub use peer::PeerId;
pub use punch::{
    DirectConnection, HolePunchMessage, PunchCoordinator, PunchError, PunchSessionTable,
    TcpPuncher, UdpPuncher, WireError,
};

/// Boxed error returned by consumed (externally implemented) interfaces
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
