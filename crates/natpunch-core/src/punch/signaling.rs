//! Interfaces the coordinator consumes from the host application
//!
//! The application owns the relay/transport used for signaling, knows which
//! addresses it can offer and may have its own way of dialing a peer.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::protocol::MAX_ADDRESSES;
use crate::BoxError;
use crate::peer::PeerId;

/// Bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned byte stream
pub type BoxStream = Box<dyn ByteStream>;

/// Opens negotiation streams over an existing (typically relayed) connection
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Open a stream to `peer` speaking `protocol`
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, BoxError>;
}

/// Sources of local addresses to offer a peer, from most to least trusted
pub trait AddressSource: Send + Sync {
    /// Every listen address
    fn addrs(&self) -> Vec<SocketAddr>;

    /// Addresses previously verified reachable
    fn shareable_addrs(&self) -> Vec<SocketAddr>;

    /// Addresses the application advertises
    fn advertised_addrs(&self) -> Vec<SocketAddr>;

    /// Externally observed (STUN) addresses
    fn hole_punch_addrs(&self) -> Vec<SocketAddr>;
}

/// Best addresses to offer: the first non-empty source wins
///
/// Priority: hole punch (STUN verified), shareable, advertised, all listen
/// addresses. Capped at the wire limit.
#[must_use]
pub fn best_addrs(source: &dyn AddressSource) -> Vec<SocketAddr> {
    let mut addrs = source.hole_punch_addrs();
    if addrs.is_empty() {
        addrs = source.shareable_addrs();
    }
    if addrs.is_empty() {
        addrs = source.advertised_addrs();
    }
    if addrs.is_empty() {
        addrs = source.addrs();
    }
    addrs.truncate(MAX_ADDRESSES);
    addrs
}

/// Application-provided dialer used alongside the raw punchers
#[async_trait]
pub trait DirectDialer: Send + Sync {
    /// Dial `peer` directly at `addr`
    async fn dial_direct(
        &self,
        peer: &PeerId,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, BoxError>;
}
