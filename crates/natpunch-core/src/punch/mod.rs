//! Hole Punching Module
//!
//! Establishes direct connections between two NATed peers:
//!
//! 1. Both sides exchange observed addresses over an existing signaling
//!    stream (`Connect`), then rendezvous with a `Sync` round trip.
//! 2. Immediately after `Sync` both sides dial every candidate at once:
//!    UDP with nonce-tagged packets ([`UdpPuncher`]), TCP with
//!    simultaneous open ([`TcpPuncher`]) and optionally an application
//!    supplied [`DirectDialer`].
//! 3. The whole negotiation is retried a bounded number of times.
//!
//! Failure is an expected outcome under restrictive NATs:
//! [`PunchError::is_expected`] tells the caller to fall back to the relay.

pub mod coordinator;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};

use crate::BoxError;
use crate::nat::NatType;
use crate::peer::PeerId;

// Re-exports
pub use crate::config::{CoordinatorConfig, TcpPunchConfig, UdpPunchConfig};
pub use coordinator::{HOLE_PUNCH_PROTOCOL, PunchCoordinator, PunchCoordinatorBuilder};
pub use protocol::{
    HolePunchMessage, MAX_ADDRESSES, NONCE_LEN, WireError, random_nonce, read_message,
    write_message,
};
pub use session::{PunchSession, PunchSessionTable, SessionGuard, SessionOutcome};
pub use signaling::{AddressSource, BoxStream, ByteStream, DirectDialer, Signaling, best_addrs};
pub use tcp::TcpPuncher;
pub use udp::{PacketKind, UdpPunch, UdpPuncher, build_packet, validate_packet};

/// Hole punching error
///
/// Four families, matching how callers should react:
/// - transport: retried locally, then surfaced
/// - protocol: the negotiation step fails, never retried
/// - policy: surfaced immediately
/// - exhaustion: expected, fall back to the relay
#[derive(Debug, Error)]
pub enum PunchError {
    /// A punch session with this peer is already running
    #[error("hole punch already active for {0}")]
    AlreadyActive(PeerId),

    /// Local NAT makes punching pointless
    #[error("NAT type {0} unsuitable for hole punching")]
    UnsuitableNat(NatType),

    /// Remote refused the request
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// Signaling stream could not be opened or failed mid-negotiation
    #[error("signaling failed: {0}")]
    Signaling(BoxError),

    /// Malformed negotiation message
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Peer sent a message out of sequence
    #[error("unexpected {got} message, expected {expected}")]
    UnexpectedMessage {
        /// Message type that was expected
        expected: &'static str,
        /// Message type received
        got: &'static str,
    },

    /// Peer echoed a different nonce
    #[error("nonce mismatch")]
    NonceMismatch,

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No usable candidate addresses
    #[error("no candidate addresses")]
    NoCandidates,

    /// No valid punch reply from any candidate
    #[error("no response from peer")]
    NoPeerResponse,

    /// Every connect attempt against every candidate failed
    #[error("all connection attempts failed: {0}")]
    ConnectFailed(String),

    /// Time limit exceeded
    #[error("hole punch timed out")]
    Timeout,

    /// Retries exhausted
    #[error("hole punch failed after {attempts} attempts: {reason}")]
    HolePunchFailed {
        /// Negotiation attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// Caller cancelled
    #[error("hole punch cancelled")]
    Cancelled,
}

impl PunchError {
    /// Exhaustion: an expected outcome that should trigger relay fallback,
    /// logged at low severity
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::HolePunchFailed { .. }
                | Self::NoPeerResponse
                | Self::ConnectFailed(_)
                | Self::NoCandidates
                | Self::Timeout
        )
    }

    /// The caller gave up, as opposed to the environment
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the negotiation may be retried
    ///
    /// Transport and exhaustion errors are retriable. Protocol, policy and
    /// cancellation errors are not.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Signaling(_)
                | Self::Io(_)
                | Self::NoCandidates
                | Self::NoPeerResponse
                | Self::ConnectFailed(_)
                | Self::Timeout
        )
    }
}

/// A direct connection produced by a successful punch
pub enum DirectConnection {
    /// UDP path; the socket has exchanged valid punch packets with `remote`
    Udp {
        /// Socket the punch succeeded on
        socket: UdpSocket,
        /// Peer's address as observed on the wire
        remote: SocketAddr,
    },

    /// TCP stream from simultaneous open or a plain connect
    Tcp {
        /// Connected stream
        stream: TcpStream,
        /// Peer address
        remote: SocketAddr,
    },

    /// Stream returned by the application's [`DirectDialer`]
    Dialed {
        /// Connected stream
        stream: BoxStream,
        /// Address dialed
        remote: SocketAddr,
    },
}

impl DirectConnection {
    /// Remote address of the connection
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        match self {
            Self::Udp { remote, .. } | Self::Tcp { remote, .. } | Self::Dialed { remote, .. } => {
                *remote
            }
        }
    }

    /// Transport name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Udp { .. } => "udp",
            Self::Tcp { .. } => "tcp",
            Self::Dialed { .. } => "dialed",
        }
    }
}

impl std::fmt::Debug for DirectConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectConnection")
            .field("kind", &self.kind())
            .field("remote", &self.remote())
            .finish()
    }
}
