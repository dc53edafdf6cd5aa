//! Punch coordinator
//!
//! Drives a hole punch end to end over a signaling stream:
//!
//! ```text
//! initiator                         responder
//!     | -- Connect(addrs_i, nonce) --> |
//!     | <-- Connect(addrs_i, addrs_r) -- |
//!     | -- Sync(nonce) --------------> |
//!     | <-- Sync(nonce) -------------- |  responder starts dialing
//!     | initiator starts dialing       |
//! ```
//!
//! Each side dials the other's addresses with every configured transport at
//! once. The initiator retries the whole negotiation with the same nonce.
//! A responder that sees a retry of a session it still runs drops the old
//! round and starts over.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, trace, warn};

use super::protocol::{
    HolePunchMessage, NONCE_LEN, WireError, random_nonce, read_message, write_message,
};
use super::session::{PunchSession, PunchSessionTable, SessionOutcome};
use super::signaling::{AddressSource, BoxStream, DirectDialer, Signaling, best_addrs};
use super::tcp::TcpPuncher;
use super::udp::UdpPuncher;
use super::{DirectConnection, PunchError};
use crate::config::{CoordinatorConfig, TcpPunchConfig, UdpPunchConfig};
use crate::nat::{NatDetector, NatType};
use crate::peer::PeerId;

/// Protocol identifier of the negotiation stream
pub const HOLE_PUNCH_PROTOCOL: &str = "/natpunch/holepunch/1.0.0";

/// Orchestrates hole punches with remote peers
pub struct PunchCoordinator {
    local_id: PeerId,
    signaling: Arc<dyn Signaling>,
    addresses: Arc<dyn AddressSource>,
    sessions: Arc<PunchSessionTable>,
    udp: Option<UdpPuncher>,
    tcp: Option<TcpPuncher>,
    dialer: Option<Arc<dyn DirectDialer>>,
    nat_detector: Option<Arc<NatDetector>>,
    config: CoordinatorConfig,
    span: Span,
}

/// Builder for [`PunchCoordinator`]
///
/// UDP and TCP punchers with default configuration are enabled unless
/// replaced or disabled.
pub struct PunchCoordinatorBuilder {
    local_id: PeerId,
    signaling: Arc<dyn Signaling>,
    addresses: Arc<dyn AddressSource>,
    sessions: Option<Arc<PunchSessionTable>>,
    udp: Option<UdpPuncher>,
    tcp: Option<TcpPuncher>,
    dialer: Option<Arc<dyn DirectDialer>>,
    nat_detector: Option<Arc<NatDetector>>,
    config: CoordinatorConfig,
    span: Span,
}

impl PunchCoordinatorBuilder {
    /// Use `puncher` for UDP
    #[must_use]
    pub fn udp(mut self, puncher: UdpPuncher) -> Self {
        self.udp = Some(puncher);
        self
    }

    /// Do not punch over UDP
    #[must_use]
    pub fn without_udp(mut self) -> Self {
        self.udp = None;
        self
    }

    /// Use `puncher` for TCP
    #[must_use]
    pub fn tcp(mut self, puncher: TcpPuncher) -> Self {
        self.tcp = Some(puncher);
        self
    }

    /// Do not punch over TCP
    #[must_use]
    pub fn without_tcp(mut self) -> Self {
        self.tcp = None;
        self
    }

    /// Also dial candidates through the application's dialer
    #[must_use]
    pub fn dialer(mut self, dialer: Arc<dyn DirectDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Consult `detector` for the symmetric NAT check
    #[must_use]
    pub fn nat_detector(mut self, detector: Arc<NatDetector>) -> Self {
        self.nat_detector = Some(detector);
        self
    }

    /// Share a session table
    #[must_use]
    pub fn sessions(mut self, sessions: Arc<PunchSessionTable>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Coordinator configuration
    #[must_use]
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach log output to `span`
    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Build the coordinator
    #[must_use]
    pub fn build(self) -> PunchCoordinator {
        PunchCoordinator {
            local_id: self.local_id,
            signaling: self.signaling,
            addresses: self.addresses,
            sessions: self.sessions.unwrap_or_default(),
            udp: self.udp,
            tcp: self.tcp,
            dialer: self.dialer,
            nat_detector: self.nat_detector,
            config: self.config,
            span: self.span,
        }
    }
}

impl PunchCoordinator {
    /// Start building a coordinator for the local peer `local_id`
    #[must_use]
    pub fn builder(
        local_id: PeerId,
        signaling: Arc<dyn Signaling>,
        addresses: Arc<dyn AddressSource>,
    ) -> PunchCoordinatorBuilder {
        PunchCoordinatorBuilder {
            local_id,
            signaling,
            addresses,
            sessions: None,
            udp: Some(UdpPuncher::new(UdpPunchConfig::default())),
            tcp: Some(TcpPuncher::new(TcpPunchConfig::default())),
            dialer: None,
            nat_detector: None,
            config: CoordinatorConfig::default(),
            span: Span::none(),
        }
    }

    /// Local peer identity
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Live sessions
    #[must_use]
    pub fn sessions(&self) -> &Arc<PunchSessionTable> {
        &self.sessions
    }

    /// Coordinator configuration
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Punch a direct connection to `peer`
    ///
    /// `hints` are extra candidate addresses tried alongside the ones the
    /// peer advertises.
    ///
    /// # Errors
    ///
    /// - `PunchError::AlreadyActive` if a punch with `peer` is running
    /// - `PunchError::UnsuitableNat` when configured to skip symmetric NATs
    /// - `PunchError::Rejected` if the peer refused
    /// - `PunchError::HolePunchFailed` when retries are exhausted
    /// - `PunchError::Timeout` when the session timeout expires
    /// - `PunchError::Cancelled` when `cancel` fires
    pub async fn direct_connect(
        &self,
        peer: &PeerId,
        hints: &[SocketAddr],
        cancel: &CancellationToken,
    ) -> Result<DirectConnection, PunchError> {
        let span = tracing::info_span!(parent: &self.span, "direct_connect", peer = %peer.short());
        async {
            let session = self
                .sessions
                .create(peer, random_nonce())
                .map_err(|_| PunchError::AlreadyActive(peer.clone()))?;
            let guard = self.sessions.guard(session);
            self.check_nat()?;

            let session = guard.session();
            let result = self
                .bounded(
                    cancel,
                    self.config.session_timeout,
                    self.initiate_with_retries(peer, hints, session, cancel),
                )
                .await;
            finish(session, &result);
            result
        }
        .instrument(span)
        .await
    }

    /// Ask `peer` to punch toward us (reverse connect)
    ///
    /// On success the peer opens its own negotiation, which arrives through
    /// [`PunchCoordinator::handle_inbound`].
    ///
    /// # Errors
    ///
    /// `PunchError::Rejected` if the peer refused, plus transport and
    /// protocol errors of the exchange.
    pub async fn request_reverse(
        &self,
        peer: &PeerId,
        cancel: &CancellationToken,
    ) -> Result<(), PunchError> {
        let span =
            tracing::debug_span!(parent: &self.span, "request_reverse", peer = %peer.short());
        self.bounded(cancel, self.config.negotiation_timeout, async {
            let mut stream = self.open_stream(peer, cancel).await?;
            let request = HolePunchMessage::Request {
                initiator_id: self.local_id.to_string(),
                initiator_addrs: self.offered_addrs(),
                responder_id: peer.to_string(),
            };
            write_message(&mut stream, &request).await.map_err(wire_error)?;

            match read_message(&mut stream).await.map_err(wire_error)? {
                HolePunchMessage::Response { success: true, .. } => {
                    debug!("reverse connect accepted");
                    Ok(())
                }
                HolePunchMessage::Response { error, .. } => Err(PunchError::Rejected(error)),
                other => Err(PunchError::UnexpectedMessage {
                    expected: "Response",
                    got: other.message_type(),
                }),
            }
        })
        .instrument(span)
        .await
    }

    /// Serve a negotiation stream opened by `peer`
    ///
    /// A `Connect` runs the responder side of the punch. A `Request` is
    /// acknowledged and answered with our own [`direct_connect`].
    ///
    /// [`direct_connect`]: PunchCoordinator::direct_connect
    ///
    /// # Errors
    ///
    /// Same families as [`PunchCoordinator::direct_connect`]. Refusals are
    /// reported to the peer before the error is returned.
    pub async fn handle_inbound(
        &self,
        peer: &PeerId,
        mut stream: BoxStream,
        cancel: &CancellationToken,
    ) -> Result<DirectConnection, PunchError> {
        let span = tracing::info_span!(parent: &self.span, "handle_inbound", peer = %peer.short());
        async {
            let first = self
                .bounded(cancel, self.config.negotiation_timeout, async {
                    read_message(&mut stream).await.map_err(wire_error)
                })
                .await?;

            match first {
                HolePunchMessage::Connect {
                    initiator_addrs,
                    nonce,
                    ..
                } => {
                    self.respond(peer, stream, initiator_addrs, &nonce, cancel)
                        .await
                }
                HolePunchMessage::Request {
                    initiator_id,
                    initiator_addrs,
                    responder_id,
                } => {
                    self.accept_reverse(peer, stream, &initiator_id, &responder_id, cancel)
                        .await?;
                    let hints = parse_addrs(&initiator_addrs);
                    self.direct_connect(peer, &hints, cancel).await
                }
                other => Err(PunchError::UnexpectedMessage {
                    expected: "Connect",
                    got: other.message_type(),
                }),
            }
        }
        .instrument(span)
        .await
    }

    async fn initiate_with_retries(
        &self,
        peer: &PeerId,
        hints: &[SocketAddr],
        session: &Arc<PunchSession>,
        cancel: &CancellationToken,
    ) -> Result<DirectConnection, PunchError> {
        let attempts = self.config.max_hole_punch_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!(attempt, delay = ?self.config.retry_delay, "retrying hole punch");
                tokio::select! {
                    () = cancel.cancelled() => return Err(PunchError::Cancelled),
                    () = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            match self.initiate(peer, hints, session, cancel).await {
                Ok(conn) => return Ok(conn),
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) => {
                    debug!(attempt, error = %e, "hole punch attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map_or_else(String::new, |e| e.to_string());
        debug!(attempts, %reason, "hole punch failed, fall back to relay");
        Err(PunchError::HolePunchFailed { attempts, reason })
    }

    async fn initiate(
        &self,
        peer: &PeerId,
        hints: &[SocketAddr],
        session: &Arc<PunchSession>,
        cancel: &CancellationToken,
    ) -> Result<DirectConnection, PunchError> {
        let nonce = session.nonce();
        let remote_addrs = self
            .bounded(cancel, self.config.negotiation_timeout, async {
                let mut stream = self.open_stream(peer, cancel).await?;

                let connect = HolePunchMessage::Connect {
                    initiator_addrs: self.offered_addrs(),
                    responder_addrs: Vec::new(),
                    nonce: nonce.to_vec(),
                };
                write_message(&mut stream, &connect).await.map_err(wire_error)?;

                let responder_addrs = match read_message(&mut stream).await.map_err(wire_error)? {
                    HolePunchMessage::Connect {
                        responder_addrs,
                        nonce: echoed,
                        ..
                    } => {
                        check_nonce(&echoed, nonce)?;
                        responder_addrs
                    }
                    HolePunchMessage::Response {
                        success: false,
                        error,
                        ..
                    } => return Err(PunchError::Rejected(error)),
                    other => {
                        return Err(PunchError::UnexpectedMessage {
                            expected: "Connect",
                            got: other.message_type(),
                        });
                    }
                };

                let sync = HolePunchMessage::Sync {
                    nonce: nonce.to_vec(),
                };
                write_message(&mut stream, &sync).await.map_err(wire_error)?;
                expect_sync(&mut stream, nonce).await?;
                Ok::<_, PunchError>(responder_addrs)
            })
            .await?;

        let mut candidates = parse_addrs(&remote_addrs);
        for hint in hints {
            if !candidates.contains(hint) {
                candidates.push(*hint);
            }
        }
        trace!(candidates = ?candidates, "negotiation complete");
        self.punch(peer, session, candidates, cancel).await
    }

    async fn respond(
        &self,
        peer: &PeerId,
        mut stream: BoxStream,
        initiator_addrs: Vec<String>,
        nonce: &[u8],
        cancel: &CancellationToken,
    ) -> Result<DirectConnection, PunchError> {
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| PunchError::Protocol(WireError::InvalidNonce(nonce.len())))?;

        let Some(session) = self.claim_session(peer, nonce) else {
            refuse(&mut stream, &nonce, "hole punch already active").await;
            return Err(PunchError::AlreadyActive(peer.clone()));
        };
        let guard = self.sessions.guard(session);
        let session = guard.session();

        if let Err(e) = self.check_nat() {
            refuse(&mut stream, &nonce, &e.to_string()).await;
            session.complete(SessionOutcome::Failed(e.to_string()));
            return Err(e);
        }

        let negotiated = self
            .bounded(cancel, self.config.negotiation_timeout, async {
                let reply = HolePunchMessage::Connect {
                    initiator_addrs: initiator_addrs.clone(),
                    responder_addrs: self.offered_addrs(),
                    nonce: nonce.to_vec(),
                };
                write_message(&mut stream, &reply).await.map_err(wire_error)?;

                expect_sync(&mut stream, &nonce).await?;
                let sync = HolePunchMessage::Sync {
                    nonce: nonce.to_vec(),
                };
                write_message(&mut stream, &sync).await.map_err(wire_error)?;
                Ok::<(), PunchError>(())
            })
            .await;

        let result = match negotiated {
            Ok(()) => {
                let candidates = parse_addrs(&initiator_addrs);
                self.bounded(
                    cancel,
                    self.config.session_timeout,
                    self.punch(peer, session, candidates, cancel),
                )
                .await
            }
            Err(e) => Err(e),
        };
        finish(session, &result);
        result
    }

    /// Validate a reverse-connect request and acknowledge it
    async fn accept_reverse(
        &self,
        peer: &PeerId,
        mut stream: BoxStream,
        initiator_id: &str,
        responder_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PunchError> {
        let nonce = random_nonce();
        if responder_id != self.local_id.as_str() || initiator_id != peer.as_str() {
            let reason =
                format!("request for {responder_id} from {initiator_id} not addressed to us");
            warn!(%reason, "refusing reverse connect");
            refuse(&mut stream, &nonce, &reason).await;
            return Err(PunchError::Rejected(reason));
        }
        if self.sessions.contains(peer) {
            refuse(&mut stream, &nonce, "hole punch already active").await;
            return Err(PunchError::AlreadyActive(peer.clone()));
        }
        if let Err(e) = self.check_nat() {
            refuse(&mut stream, &nonce, &e.to_string()).await;
            return Err(e);
        }

        self.bounded(cancel, self.config.negotiation_timeout, async {
            write_message(&mut stream, &HolePunchMessage::response(true, &nonce, ""))
                .await
                .map_err(wire_error)
        })
        .await?;
        debug!("reverse connect accepted, initiating");
        Ok(())
    }

    /// Register a responder session, replacing a stale round of the same
    /// negotiation
    fn claim_session(&self, peer: &PeerId, nonce: [u8; NONCE_LEN]) -> Option<Arc<PunchSession>> {
        match self.sessions.create(peer, nonce) {
            Ok(session) => Some(session),
            Err(stale) if stale.nonce() == &nonce => {
                debug!("peer retried negotiation, dropping previous round");
                stale.complete(SessionOutcome::Failed("superseded by retry".into()));
                self.sessions.remove(&stale);
                self.sessions.create(peer, nonce).ok()
            }
            Err(_) => None,
        }
    }

    /// Dial the candidates unless the session is ended elsewhere first
    async fn punch(
        &self,
        peer: &PeerId,
        session: &Arc<PunchSession>,
        candidates: Vec<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<DirectConnection, PunchError> {
        if candidates.is_empty() {
            return Err(PunchError::NoCandidates);
        }
        session.set_candidates(candidates.clone());

        tokio::select! {
            outcome = session.wait() => {
                debug!(?outcome, "session ended while dialing");
                Err(PunchError::Cancelled)
            }
            r = self.dial_all(peer, session.nonce(), &candidates, cancel) => r,
        }
    }

    /// Dial every candidate over every transport; first success wins
    async fn dial_all(
        &self,
        peer: &PeerId,
        nonce: &[u8; NONCE_LEN],
        candidates: &[SocketAddr],
        cancel: &CancellationToken,
    ) -> Result<DirectConnection, PunchError> {
        let round = cancel.child_token();

        let udp = async {
            match &self.udp {
                Some(udp) => udp
                    .punch(peer, nonce, candidates, &round)
                    .await
                    .map(|p| DirectConnection::Udp {
                        socket: p.socket,
                        remote: p.remote,
                    }),
                None => Err(PunchError::NoCandidates),
            }
        };
        let tcp = async {
            match &self.tcp {
                Some(tcp) => tcp
                    .punch(peer, candidates, &round)
                    .await
                    .map(|(stream, remote)| DirectConnection::Tcp { stream, remote }),
                None => Err(PunchError::NoCandidates),
            }
        };
        let dialed = async {
            match &self.dialer {
                Some(dialer) => {
                    dial_candidates(
                        Arc::clone(dialer),
                        peer,
                        candidates,
                        self.config.dial_timeout,
                        &round,
                    )
                    .await
                }
                None => Err(PunchError::NoCandidates),
            }
        };
        tokio::pin!(udp, tcp, dialed);

        let mut udp_pending = self.udp.is_some();
        let mut tcp_pending = self.tcp.is_some();
        let mut dial_pending = self.dialer.is_some();
        let mut failures = Vec::new();

        let result = loop {
            if !(udp_pending || tcp_pending || dial_pending) {
                break Err(aggregate(failures, cancel));
            }
            let (transport, r) = tokio::select! {
                r = &mut udp, if udp_pending => { udp_pending = false; ("udp", r) }
                r = &mut tcp, if tcp_pending => { tcp_pending = false; ("tcp", r) }
                r = &mut dialed, if dial_pending => { dial_pending = false; ("dialer", r) }
            };
            match r {
                Ok(conn) => break Ok(conn),
                Err(e) => {
                    trace!(transport, error = %e, "transport failed");
                    failures.push(e);
                }
            }
        };
        round.cancel();

        if let Ok(conn) = &result {
            info!(
                transport = conn.kind(),
                remote = %conn.remote(),
                "direct connection established"
            );
        }
        result
    }

    fn check_nat(&self) -> Result<(), PunchError> {
        if !self.config.skip_on_symmetric_nat {
            return Ok(());
        }
        match self.nat_detector.as_ref().and_then(|d| d.cached()) {
            Some(nat) if !nat.punch_friendly() => {
                debug!(%nat, "skipping hole punch");
                Err(PunchError::UnsuitableNat(nat))
            }
            Some(_) | None => Ok(()),
        }
    }

    /// Local NAT type last detected, if any
    #[must_use]
    pub fn nat_type(&self) -> Option<NatType> {
        self.nat_detector.as_ref().and_then(|d| d.cached())
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, PunchError> {
        self.signaling
            .open_stream(peer, HOLE_PUNCH_PROTOCOL, cancel)
            .await
            .map_err(PunchError::Signaling)
    }

    fn offered_addrs(&self) -> Vec<String> {
        best_addrs(self.addresses.as_ref())
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Run `fut` under `limit`, aborting on cancel
    async fn bounded<T, F>(
        &self,
        cancel: &CancellationToken,
        limit: Duration,
        fut: F,
    ) -> Result<T, PunchError>
    where
        F: Future<Output = Result<T, PunchError>>,
    {
        tokio::select! {
            () = cancel.cancelled() => Err(PunchError::Cancelled),
            r = tokio::time::timeout(limit, fut) => r.unwrap_or(Err(PunchError::Timeout)),
        }
    }
}

async fn dial_candidates(
    dialer: Arc<dyn DirectDialer>,
    peer: &PeerId,
    candidates: &[SocketAddr],
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<DirectConnection, PunchError> {
    let mut tasks = JoinSet::new();
    for &addr in candidates {
        let dialer = Arc::clone(&dialer);
        let peer = peer.clone();
        let cancel = cancel.clone();
        tasks.spawn(
            async move {
                match tokio::time::timeout(limit, dialer.dial_direct(&peer, addr, &cancel)).await {
                    Ok(Ok(stream)) => Ok((stream, addr)),
                    Ok(Err(e)) => Err(format!("{addr}: {e}")),
                    Err(_) => Err(format!("{addr}: dial timed out")),
                }
            }
            .in_current_span(),
        );
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((stream, remote))) => return Ok(DirectConnection::Dialed { stream, remote }),
            Ok(Err(e)) => failures.push(e),
            Err(join_err) => failures.push(join_err.to_string()),
        }
    }
    if cancel.is_cancelled() {
        return Err(PunchError::Cancelled);
    }
    Err(PunchError::ConnectFailed(failures.join("; ")))
}

fn aggregate(mut failures: Vec<PunchError>, cancel: &CancellationToken) -> PunchError {
    if cancel.is_cancelled() {
        return PunchError::Cancelled;
    }
    match failures.len() {
        0 => PunchError::ConnectFailed("no transport enabled".into()),
        1 => failures.remove(0),
        _ => PunchError::ConnectFailed(
            failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        ),
    }
}

fn finish(session: &PunchSession, result: &Result<DirectConnection, PunchError>) {
    let outcome = match result {
        Ok(conn) => SessionOutcome::Connected(conn.remote()),
        Err(e) => SessionOutcome::Failed(e.to_string()),
    };
    session.complete(outcome);
}

async fn expect_sync(stream: &mut BoxStream, nonce: &[u8; NONCE_LEN]) -> Result<(), PunchError> {
    match read_message(stream).await.map_err(wire_error)? {
        HolePunchMessage::Sync { nonce: echoed } => check_nonce(&echoed, nonce),
        other => Err(PunchError::UnexpectedMessage {
            expected: "Sync",
            got: other.message_type(),
        }),
    }
}

fn check_nonce(echoed: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<(), PunchError> {
    if echoed == nonce {
        Ok(())
    } else {
        Err(PunchError::NonceMismatch)
    }
}

/// Best-effort refusal; the stream may already be gone
async fn refuse(stream: &mut BoxStream, nonce: &[u8; NONCE_LEN], reason: &str) {
    let msg = HolePunchMessage::response(false, nonce, reason);
    if let Err(e) = write_message(stream, &msg).await {
        trace!(error = %e, "failed to send refusal");
    }
}

/// Stream failures are transport errors; everything else is protocol
fn wire_error(err: WireError) -> PunchError {
    match err {
        WireError::Io(e) => PunchError::Signaling(Box::new(e)),
        WireError::Truncated => PunchError::Signaling("signaling stream closed".into()),
        other => PunchError::Protocol(other),
    }
}

fn parse_addrs(addrs: &[String]) -> Vec<SocketAddr> {
    addrs
        .iter()
        .filter_map(|a| match a.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                trace!(addr = %a, "skipping unparseable address");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::BoxError;

    struct Static(Vec<SocketAddr>);

    impl AddressSource for Static {
        fn addrs(&self) -> Vec<SocketAddr> {
            Vec::new()
        }
        fn shareable_addrs(&self) -> Vec<SocketAddr> {
            Vec::new()
        }
        fn advertised_addrs(&self) -> Vec<SocketAddr> {
            Vec::new()
        }
        fn hole_punch_addrs(&self) -> Vec<SocketAddr> {
            self.0.clone()
        }
    }

    /// Hands each opened stream to the remote coordinator's `handle_inbound`
    struct Loopback {
        local: PeerId,
        remote: OnceLock<Arc<PunchCoordinator>>,
        inbound: mpsc::UnboundedSender<Result<DirectConnection, PunchError>>,
    }

    #[async_trait]
    impl Signaling for Loopback {
        async fn open_stream(
            &self,
            _peer: &PeerId,
            protocol: &str,
            cancel: &CancellationToken,
        ) -> Result<BoxStream, BoxError> {
            assert_eq!(protocol, HOLE_PUNCH_PROTOCOL);
            let remote = self.remote.get().cloned().ok_or("peer unreachable")?;
            let (ours, theirs) = tokio::io::duplex(4096);
            let local = self.local.clone();
            let tx = self.inbound.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let r = remote.handle_inbound(&local, Box::new(theirs), &cancel).await;
                let _ = tx.send(r);
            });
            Ok(Box::new(ours))
        }
    }

    /// Fails every open and counts attempts
    #[derive(Default)]
    struct Unreachable {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Signaling for Unreachable {
        async fn open_stream(
            &self,
            _peer: &PeerId,
            _protocol: &str,
            _cancel: &CancellationToken,
        ) -> Result<BoxStream, BoxError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err("relay down".into())
        }
    }

    /// Answers every stream with fixed bytes
    struct Scripted {
        reply: Vec<u8>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Signaling for Scripted {
        async fn open_stream(
            &self,
            _peer: &PeerId,
            _protocol: &str,
            _cancel: &CancellationToken,
        ) -> Result<BoxStream, BoxError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (ours, mut theirs) = tokio::io::duplex(4096);
            let reply = self.reply.clone();
            tokio::spawn(async move {
                let _ = theirs.write_all(&reply).await;
                // Keep the stream open until the other side hangs up
                let _ = tokio::io::copy(&mut theirs, &mut tokio::io::sink()).await;
            });
            Ok(Box::new(ours))
        }
    }

    fn quick_config() -> CoordinatorConfig {
        CoordinatorConfig {
            max_hole_punch_retries: 2,
            retry_delay: Duration::from_millis(10),
            negotiation_timeout: Duration::from_secs(2),
            session_timeout: Duration::from_secs(10),
            ..CoordinatorConfig::default()
        }
    }

    fn tcp_only(
        id: &str,
        signaling: Arc<dyn Signaling>,
        addrs: Vec<SocketAddr>,
    ) -> PunchCoordinator {
        PunchCoordinator::builder(PeerId::from(id), signaling, Arc::new(Static(addrs)))
            .without_udp()
            .tcp(TcpPuncher::new(TcpPunchConfig {
                max_attempts: 2,
                attempt_interval: Duration::from_millis(10),
                ..TcpPunchConfig::default()
            }))
            .config(quick_config())
            .build()
    }

    struct Pair {
        alice: Arc<PunchCoordinator>,
        bob: Arc<PunchCoordinator>,
        bob_inbound: mpsc::UnboundedReceiver<Result<DirectConnection, PunchError>>,
        alice_listener: TcpListener,
        bob_listener: TcpListener,
    }

    async fn tcp_pair() -> Pair {
        let alice_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bob_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (to_bob, bob_inbound) = mpsc::unbounded_channel();
        let (to_alice, _alice_inbound) = mpsc::unbounded_channel();
        let alice_signaling = Arc::new(Loopback {
            local: PeerId::from("alice"),
            remote: OnceLock::new(),
            inbound: to_bob,
        });
        let bob_signaling = Arc::new(Loopback {
            local: PeerId::from("bob"),
            remote: OnceLock::new(),
            inbound: to_alice,
        });

        let alice = Arc::new(tcp_only(
            "alice",
            alice_signaling.clone(),
            vec![alice_listener.local_addr().unwrap()],
        ));
        let bob = Arc::new(tcp_only(
            "bob",
            bob_signaling.clone(),
            vec![bob_listener.local_addr().unwrap()],
        ));
        let _ = alice_signaling.remote.set(Arc::clone(&bob));
        let _ = bob_signaling.remote.set(Arc::clone(&alice));

        Pair {
            alice,
            bob,
            bob_inbound,
            alice_listener,
            bob_listener,
        }
    }

    #[tokio::test]
    async fn test_direct_connect_over_tcp() {
        let mut pair = tcp_pair().await;
        let bob_addr = pair.bob_listener.local_addr().unwrap();
        let alice_addr = pair.alice_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = pair.bob_listener.accept().await;
        });
        tokio::spawn(async move {
            let _ = pair.alice_listener.accept().await;
        });

        let conn = pair
            .alice
            .direct_connect(&PeerId::from("bob"), &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(conn.kind(), "tcp");
        assert_eq!(conn.remote(), bob_addr);

        let inbound = pair.bob_inbound.recv().await.unwrap().unwrap();
        assert_eq!(inbound.remote(), alice_addr);

        assert!(pair.alice.sessions().is_empty());
        assert!(pair.bob.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_local_session_already_active() {
        let pair = tcp_pair().await;
        let bob = PeerId::from("bob");
        let _live = pair.alice.sessions().create(&bob, [0; NONCE_LEN]).unwrap();

        let err = pair
            .alice
            .direct_connect(&bob, &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PunchError::AlreadyActive(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_remote_session_conflict_is_rejected() {
        let mut pair = tcp_pair().await;
        let _live = pair
            .bob
            .sessions()
            .create(&PeerId::from("alice"), [9; NONCE_LEN])
            .unwrap();

        let err = pair
            .alice
            .direct_connect(&PeerId::from("bob"), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PunchError::Rejected(_)), "{err}");

        // Not retried: exactly one inbound negotiation reached bob
        let inbound = pair.bob_inbound.recv().await.unwrap().unwrap_err();
        assert!(matches!(inbound, PunchError::AlreadyActive(_)));
        assert!(pair.bob_inbound.try_recv().is_err());
    }

    /// Play alice's side of a Connect toward bob by hand
    async fn connect_to(
        bob: &Arc<PunchCoordinator>,
        alice_addr: SocketAddr,
        nonce: [u8; NONCE_LEN],
    ) -> (
        tokio::io::DuplexStream,
        HolePunchMessage,
        tokio::task::JoinHandle<Result<DirectConnection, PunchError>>,
    ) {
        let (mut ours, theirs) = tokio::io::duplex(4096);
        let responder = Arc::clone(bob);
        let handler = tokio::spawn(async move {
            responder
                .handle_inbound(
                    &PeerId::from("alice"),
                    Box::new(theirs),
                    &CancellationToken::new(),
                )
                .await
        });

        let connect = HolePunchMessage::Connect {
            initiator_addrs: vec![alice_addr.to_string()],
            responder_addrs: Vec::new(),
            nonce: nonce.to_vec(),
        };
        write_message(&mut ours, &connect).await.unwrap();
        let reply = read_message(&mut ours).await.unwrap();
        (ours, reply, handler)
    }

    #[tokio::test]
    async fn test_retry_with_same_nonce_replaces_stale_session() {
        let pair = tcp_pair().await;
        let alice_addr = pair.alice_listener.local_addr().unwrap();
        let bob_addr = pair.bob_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = pair.alice_listener.accept().await;
        });

        let nonce = [7; NONCE_LEN];
        let stale = pair
            .bob
            .sessions()
            .create(&PeerId::from("alice"), nonce)
            .unwrap();

        let (mut stream, reply, handler) = connect_to(&pair.bob, alice_addr, nonce).await;
        match reply {
            HolePunchMessage::Connect {
                responder_addrs,
                nonce: echoed,
                ..
            } => {
                assert_eq!(echoed, nonce.to_vec());
                assert_eq!(responder_addrs, vec![bob_addr.to_string()]);
            }
            other => panic!("expected Connect, got {other:?}"),
        }
        let sync = HolePunchMessage::Sync {
            nonce: nonce.to_vec(),
        };
        write_message(&mut stream, &sync).await.unwrap();
        assert_eq!(read_message(&mut stream).await.unwrap(), sync);

        let conn = handler.await.unwrap().unwrap();
        assert_eq!(conn.remote(), alice_addr);
        assert_eq!(
            stale.outcome(),
            Some(SessionOutcome::Failed("superseded by retry".into()))
        );
        assert!(pair.bob.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_connect_with_other_nonce_is_refused() {
        let pair = tcp_pair().await;
        let alice_addr = pair.alice_listener.local_addr().unwrap();

        let live = pair
            .bob
            .sessions()
            .create(&PeerId::from("alice"), [9; NONCE_LEN])
            .unwrap();

        let (_stream, reply, handler) = connect_to(&pair.bob, alice_addr, [7; NONCE_LEN]).await;
        assert!(matches!(
            reply,
            HolePunchMessage::Response { success: false, .. }
        ));
        let err = handler.await.unwrap().unwrap_err();
        assert!(matches!(err, PunchError::AlreadyActive(_)));

        // The live session is untouched
        assert!(!live.is_completed());
        assert!(Arc::ptr_eq(
            &pair.bob.sessions().get(&PeerId::from("alice")).unwrap(),
            &live
        ));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let signaling = Arc::new(Unreachable::default());
        let alice = tcp_only("alice", signaling.clone(), Vec::new());

        let err = alice
            .direct_connect(&PeerId::from("bob"), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            PunchError::HolePunchFailed { attempts, reason } => {
                assert_eq!(*attempts, 3);
                assert!(reason.contains("relay down"));
            }
            other => panic!("unexpected {other}"),
        }
        assert!(err.is_expected());
        assert_eq!(signaling.opens.load(Ordering::SeqCst), 3);
        assert!(alice.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_error_not_retried() {
        let signaling = Arc::new(Scripted {
            reply: vec![0x09, 0x00],
            opens: AtomicUsize::new(0),
        });
        let alice = tcp_only("alice", signaling.clone(), Vec::new());

        let err = alice
            .direct_connect(&PeerId::from("bob"), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PunchError::Protocol(WireError::UnknownType(0x09))
        ));
        assert_eq!(signaling.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_sequence_message() {
        let sync = HolePunchMessage::Sync {
            nonce: vec![0; NONCE_LEN],
        }
        .encode()
        .unwrap();
        let signaling = Arc::new(Scripted {
            reply: sync,
            opens: AtomicUsize::new(0),
        });
        let alice = tcp_only("alice", signaling, Vec::new());

        let err = alice
            .direct_connect(&PeerId::from("bob"), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PunchError::UnexpectedMessage {
                expected: "Connect",
                got: "Sync"
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_negotiation() {
        // Silent peer: the Connect reply never comes
        let signaling = Arc::new(Scripted {
            reply: Vec::new(),
            opens: AtomicUsize::new(0),
        });
        let alice = tcp_only("alice", signaling, Vec::new());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = alice
            .direct_connect(&PeerId::from("bob"), &[], &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(alice.sessions().is_empty());
    }

    #[test]
    fn test_parse_addrs_skips_garbage() {
        let parsed = parse_addrs(&[
            "192.0.2.1:4001".into(),
            "not an address".into(),
            "[2001:db8::1]:4001".into(),
        ]);
        assert_eq!(parsed.len(), 2);
        assert!(parsed[1].is_ipv6());
    }

    #[test]
    fn test_wire_error_mapping() {
        assert!(wire_error(WireError::Truncated).is_retriable());
        assert!(!wire_error(WireError::InvalidNonce(3)).is_retriable());
    }
}
