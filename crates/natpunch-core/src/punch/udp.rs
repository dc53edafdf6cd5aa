//! UDP Hole Punching
//!
//! Each candidate gets its own socket and task. A task sends a punch packet,
//! waits `attempt_interval` for a valid packet carrying our nonce, and
//! repeats up to `max_attempts` times. The first valid packet from any
//! candidate wins and cancels the rest.
//!
//! Packet layout: `magic[4] | nonce[16] | zero padding` where the magic is
//! `P2PH` for a punch and `P2PR` for a reply.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, trace};

use super::PunchError;
use super::protocol::NONCE_LEN;
use crate::config::{MIN_PUNCH_PACKET_SIZE, UdpPunchConfig};
use crate::peer::PeerId;

/// Magic of a punch packet
pub const PUNCH_MAGIC: &[u8; 4] = b"P2PH";

/// Magic of a reply packet
pub const REPLY_MAGIC: &[u8; 4] = b"P2PR";

const RECV_BUFFER_SIZE: usize = 2048;

/// Kind of a valid punch packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `P2PH`
    Punch,
    /// `P2PR`
    Reply,
}

/// Build a punch or reply packet padded with zeros to `size` bytes
///
/// Sizes below 20 are raised to 20.
#[must_use]
pub fn build_packet(kind: PacketKind, nonce: &[u8; NONCE_LEN], size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; size.max(MIN_PUNCH_PACKET_SIZE)];
    let magic = match kind {
        PacketKind::Punch => PUNCH_MAGIC,
        PacketKind::Reply => REPLY_MAGIC,
    };
    packet[..4].copy_from_slice(magic);
    packet[4..4 + NONCE_LEN].copy_from_slice(nonce);
    packet
}

/// Validate a received packet against `nonce`
///
/// Returns `None` for short packets, unknown magic or a nonce mismatch.
#[must_use]
pub fn validate_packet(packet: &[u8], nonce: &[u8; NONCE_LEN]) -> Option<PacketKind> {
    if packet.len() < MIN_PUNCH_PACKET_SIZE {
        return None;
    }
    let kind = match &packet[..4] {
        m if m == PUNCH_MAGIC => PacketKind::Punch,
        m if m == REPLY_MAGIC => PacketKind::Reply,
        _ => return None,
    };
    (&packet[4..4 + NONCE_LEN] == nonce).then_some(kind)
}

/// Result of a successful UDP punch
#[derive(Debug)]
pub struct UdpPunch {
    /// Socket the exchange succeeded on
    pub socket: UdpSocket,
    /// Peer address the valid packet came from
    pub remote: SocketAddr,
}

/// UDP hole puncher
pub struct UdpPuncher {
    config: UdpPunchConfig,
    span: Span,
}

impl UdpPuncher {
    /// Create a puncher
    #[must_use]
    pub fn new(config: UdpPunchConfig) -> Self {
        Self {
            config,
            span: Span::none(),
        }
    }

    /// Attach log output to `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Puncher configuration
    #[must_use]
    pub fn config(&self) -> &UdpPunchConfig {
        &self.config
    }

    /// Punch toward every candidate in parallel
    ///
    /// # Errors
    ///
    /// - `PunchError::NoCandidates` for an empty candidate list
    /// - `PunchError::Cancelled` when `cancel` fires
    /// - `PunchError::Timeout` when the overall timeout expires
    /// - `PunchError::NoPeerResponse` when every candidate ran out of attempts
    /// - `PunchError::Io` when no candidate could get a socket
    pub async fn punch(
        &self,
        remote: &PeerId,
        nonce: &[u8; NONCE_LEN],
        candidates: &[SocketAddr],
        cancel: &CancellationToken,
    ) -> Result<UdpPunch, PunchError> {
        if candidates.is_empty() {
            return Err(PunchError::NoCandidates);
        }
        let span = tracing::debug_span!(parent: &self.span, "udp_punch", peer = %remote.short());

        let round = cancel.child_token();
        let result = tokio::select! {
            () = cancel.cancelled() => Err(PunchError::Cancelled),
            r = tokio::time::timeout(self.config.timeout, self.race(nonce, candidates, &round)) => {
                r.unwrap_or(Err(PunchError::Timeout))
            }
        }
        .map_err(|e| if cancel.is_cancelled() { PunchError::Cancelled } else { e });
        round.cancel();

        let _enter = span.enter();
        match &result {
            Ok(punch) => debug!(remote = %punch.remote, "UDP punch succeeded"),
            Err(e) => debug!(error = %e, "UDP punch failed"),
        }
        result
    }

    async fn race(
        &self,
        nonce: &[u8; NONCE_LEN],
        candidates: &[SocketAddr],
        round: &CancellationToken,
    ) -> Result<UdpPunch, PunchError> {
        let packet = build_packet(PacketKind::Punch, nonce, self.config.packet_size);
        let mut tasks = JoinSet::new();
        let mut bind_error = None;
        for &candidate in candidates {
            let socket = match bind_socket(candidate, self.config.local_port) {
                Ok(socket) => socket,
                Err(e) => {
                    debug!(%candidate, error = %e, "skipping candidate, bind failed");
                    bind_error = Some(e);
                    continue;
                }
            };
            tasks.spawn(
                punch_candidate(
                    socket,
                    candidate,
                    packet.clone(),
                    *nonce,
                    self.config.clone(),
                    round.clone(),
                )
                .instrument(self.span.clone()),
            );
        }
        if tasks.is_empty() {
            if let Some(e) = bind_error {
                return Err(PunchError::Io(e));
            }
        }

        let mut last_err = PunchError::NoPeerResponse;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(punch)) => {
                    round.cancel();
                    return Ok(punch);
                }
                Ok(Err(e)) => last_err = e,
                Err(join_err) => debug!(error = %join_err, "candidate task failed"),
            }
        }
        Err(match last_err {
            PunchError::Io(_) => PunchError::NoPeerResponse,
            other => other,
        })
    }
}

async fn punch_candidate(
    socket: UdpSocket,
    candidate: SocketAddr,
    packet: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    config: UdpPunchConfig,
    cancel: CancellationToken,
) -> Result<UdpPunch, PunchError> {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    for attempt in 0..config.max_attempts {
        trace!(%candidate, attempt, "sending punch packet");
        if let Err(e) = socket.send_to(&packet, candidate).await {
            // Unreachable routes fail fast; wait out the interval and retry
            trace!(%candidate, error = %e, "send failed");
        }

        let deadline = Instant::now() + config.attempt_interval;
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => return Err(PunchError::Cancelled),
                r = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)) => r,
            };
            let Ok(received) = received else { break };
            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    // ICMP errors surface here on some platforms
                    trace!(%candidate, error = %e, "receive failed");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(PunchError::Cancelled),
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                    break;
                }
            };

            match validate_packet(&buf[..len], &nonce) {
                Some(PacketKind::Punch) => {
                    let reply = build_packet(PacketKind::Reply, &nonce, packet.len());
                    // Best effort; the peer keeps sending until it sees one
                    let _ = socket.send_to(&reply, from).await;
                    return Ok(UdpPunch {
                        socket,
                        remote: from,
                    });
                }
                Some(PacketKind::Reply) => {
                    return Ok(UdpPunch {
                        socket,
                        remote: from,
                    });
                }
                None => trace!(%from, len, "ignoring invalid packet"),
            }
        }
    }
    Err(PunchError::NoPeerResponse)
}

/// Bind a UDP socket of the candidate's family, optionally on a pinned port
/// with address/port reuse so several sockets can share it
pub(crate) fn bind_socket(
    candidate: SocketAddr,
    local_port: Option<u16>,
) -> Result<UdpSocket, std::io::Error> {
    let local: SocketAddr = if candidate.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, local_port.unwrap_or(0)).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, local_port.unwrap_or(0)).into()
    };

    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    if local_port.is_some() {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}
