//! TCP Hole Punching
//!
//! TCP simultaneous open: both peers bind the same local port with address
//! and port reuse and `connect()` toward each other at the same moment. When
//! the SYNs cross in the NATs, both kernels complete the handshake without a
//! listener. A plain connect to a reachable listener also succeeds.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use dashmap::DashMap;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, trace};

use super::PunchError;
use crate::config::TcpPunchConfig;
use crate::peer::PeerId;

/// TCP hole puncher
pub struct TcpPuncher {
    config: TcpPunchConfig,
    active: DashMap<PeerId, Instant>,
    span: Span,
}

impl TcpPuncher {
    /// Create a puncher
    #[must_use]
    pub fn new(config: TcpPunchConfig) -> Self {
        Self {
            config,
            active: DashMap::new(),
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
    pub fn config(&self) -> &TcpPunchConfig {
        &self.config
    }

    /// Whether a punch toward `peer` is running
    #[must_use]
    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.active.contains_key(peer)
    }

    /// Number of running punches
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Punch toward `candidates` from the configured local port
    ///
    /// # Errors
    ///
    /// See [`TcpPuncher::punch_with_local_port`].
    pub async fn punch(
        &self,
        remote: &PeerId,
        candidates: &[SocketAddr],
        cancel: &CancellationToken,
    ) -> Result<(TcpStream, SocketAddr), PunchError> {
        self.punch_with_local_port(remote, self.config.local_port, candidates, cancel)
            .await
    }

    /// Punch toward `candidates`, binding `local_port` when given
    ///
    /// Every candidate is attempted concurrently, each up to `max_attempts`
    /// times. The first established stream wins.
    ///
    /// # Errors
    ///
    /// - `PunchError::NoCandidates` for an empty candidate list
    /// - `PunchError::ConnectFailed` when every attempt failed
    /// - `PunchError::Cancelled` when `cancel` fires
    pub async fn punch_with_local_port(
        &self,
        remote: &PeerId,
        local_port: Option<u16>,
        candidates: &[SocketAddr],
        cancel: &CancellationToken,
    ) -> Result<(TcpStream, SocketAddr), PunchError> {
        if candidates.is_empty() {
            return Err(PunchError::NoCandidates);
        }
        let span = tracing::debug_span!(parent: &self.span, "tcp_punch", peer = %remote.short());

        self.active.insert(remote.clone(), Instant::now());
        let _active = ActiveEntry {
            active: &self.active,
            peer: remote,
        };

        let round = cancel.child_token();
        let result = tokio::select! {
            () = cancel.cancelled() => Err(PunchError::Cancelled),
            r = self.race(local_port, candidates, &round).instrument(span.clone()) => r,
        };
        round.cancel();

        let _enter = span.enter();
        match &result {
            Ok((_, addr)) => debug!(remote = %addr, "TCP punch succeeded"),
            Err(e) => debug!(error = %e, "TCP punch failed"),
        }
        result
    }

    async fn race(
        &self,
        local_port: Option<u16>,
        candidates: &[SocketAddr],
        round: &CancellationToken,
    ) -> Result<(TcpStream, SocketAddr), PunchError> {
        let mut tasks = JoinSet::new();
        for &candidate in candidates {
            tasks.spawn(
                connect_candidate(candidate, local_port, self.config.clone(), round.clone())
                    .in_current_span(),
            );
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(stream)) => {
                    round.cancel();
                    return Ok(stream);
                }
                Ok(Err(e)) => failures.push(e),
                Err(join_err) => failures.push(join_err.to_string()),
            }
        }
        Err(PunchError::ConnectFailed(failures.join("; ")))
    }
}

/// Clears the active entry when the punch ends
struct ActiveEntry<'a> {
    active: &'a DashMap<PeerId, Instant>,
    peer: &'a PeerId,
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        self.active.remove(self.peer);
    }
}

async fn connect_candidate(
    candidate: SocketAddr,
    local_port: Option<u16>,
    config: TcpPunchConfig,
    cancel: CancellationToken,
) -> Result<(TcpStream, SocketAddr), String> {
    let mut last_error = String::from("no attempts made");

    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            tokio::select! {
                () = cancel.cancelled() => return Err("cancelled".into()),
                () = tokio::time::sleep(config.attempt_interval) => {}
            }
        }

        let socket = match bind_socket(candidate, local_port, config.enable_reuse_port) {
            Ok(socket) => socket,
            Err(e) => {
                last_error = format!("{candidate}: bind failed: {e}");
                continue;
            }
        };

        trace!(%candidate, attempt, "connecting");
        let connected = tokio::select! {
            () = cancel.cancelled() => return Err("cancelled".into()),
            r = tokio::time::timeout(config.connect_timeout, socket.connect(candidate)) => r,
        };
        match connected {
            Ok(Ok(stream)) => return Ok((stream, candidate)),
            Ok(Err(e)) => last_error = format!("{candidate}: {e}"),
            Err(_) => last_error = format!("{candidate}: connect timed out"),
        }
    }
    Err(last_error)
}

/// Fresh socket for one attempt; a failed connect leaves the socket unusable
///
/// SO_REUSEADDR is always set, SO_REUSEPORT only when `reuse` is.
fn bind_socket(
    candidate: SocketAddr,
    local_port: Option<u16>,
    reuse: bool,
) -> Result<TcpSocket, std::io::Error> {
    let (socket, local): (TcpSocket, SocketAddr) = if candidate.is_ipv4() {
        (
            TcpSocket::new_v4()?,
            (Ipv4Addr::UNSPECIFIED, local_port.unwrap_or(0)).into(),
        )
    } else {
        (
            TcpSocket::new_v6()?,
            (Ipv6Addr::UNSPECIFIED, local_port.unwrap_or(0)).into(),
        )
    };

    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(reuse)?;
    #[cfg(not(unix))]
    let _ = reuse;
    if local_port.is_some() {
        socket.bind(local)?;
    }
    Ok(socket)
}
