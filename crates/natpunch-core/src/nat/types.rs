//! NAT Type Detection
//!
//! Classifies the local NAT with the RFC 3489 discrimination tree:
//!
//! 1. Plain Binding to the primary server. No answer means UDP is unusable
//!    and the type is `Unknown`.
//! 2. Mapped address equal to our own socket address means no NAT.
//! 3. CHANGE-REQUEST(ip, port) answered from elsewhere means `FullCone`.
//! 4. A different mapping from a second server means `Symmetric`.
//! 5. CHANGE-REQUEST(port) answered means `RestrictedCone`, otherwise
//!    `PortRestrictedCone`.
//!
//! All probes share one socket so the mapping under test stays the same.
//! When no alternate server is configured, step 4 uses the OTHER-ADDRESS
//! learned in step 1. The result is advisory.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::stun::{StunClient, StunError, StunProbeResult};
use crate::config::NatDetectorConfig;

/// NAT type classification
///
/// Different NAT types require different traversal strategies:
/// - None: No NAT, direct connection possible
/// - Full Cone: Easy to traverse, any external host can send
/// - Restricted Cone: Requires simultaneous open
/// - Port Restricted Cone: Requires simultaneous open
/// - Symmetric: Different mapping per destination, prefer relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NatType {
    /// Detection failed or UDP is blocked
    #[default]
    Unknown,
    /// No NAT detected, public IP address
    None,
    /// Full Cone NAT - any external host can send to mapped port
    FullCone,
    /// Restricted Cone NAT - only contacted IPs can send
    RestrictedCone,
    /// Port Restricted Cone NAT - only contacted IP:port can send
    PortRestrictedCone,
    /// Symmetric NAT - different mapping per destination
    Symmetric,
}

impl NatType {
    /// Whether hole punching has a reasonable chance of success
    ///
    /// `Unknown` is treated optimistically.
    #[must_use]
    pub fn punch_friendly(self) -> bool {
        !matches!(self, Self::Symmetric)
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown NAT Type"),
            Self::None => write!(f, "None (No NAT)"),
            Self::FullCone => write!(f, "Full Cone NAT"),
            Self::RestrictedCone => write!(f, "Restricted Cone NAT"),
            Self::PortRestrictedCone => write!(f, "Port Restricted Cone NAT"),
            Self::Symmetric => write!(f, "Symmetric NAT"),
        }
    }
}

/// NAT detection error
///
/// Probe failures are not errors: they steer the classification. Only a
/// local socket failure or cancellation aborts detection.
#[derive(Debug, Error)]
pub enum NatError {
    /// Local socket could not be created
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller cancelled detection
    #[error("NAT detection cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct CachedNat {
    nat_type: NatType,
    detected_at: Instant,
}

/// NAT type detector with a TTL cache
pub struct NatDetector {
    primary: SocketAddr,
    alternate: Option<SocketAddr>,
    config: NatDetectorConfig,
    cache: RwLock<Option<CachedNat>>,
    /// Serialises detection runs; concurrent callers share one result
    run_lock: Mutex<()>,
    updates: watch::Sender<NatType>,
    span: Span,
}

impl NatDetector {
    /// Create a detector probing `primary`
    #[must_use]
    pub fn new(primary: SocketAddr, config: NatDetectorConfig) -> Self {
        let (updates, _) = watch::channel(NatType::Unknown);
        Self {
            primary,
            alternate: None,
            config,
            cache: RwLock::new(None),
            run_lock: Mutex::new(()),
            updates,
            span: Span::none(),
        }
    }

    /// Use an independent second server for the symmetric-NAT test
    #[must_use]
    pub fn with_alternate(mut self, alternate: SocketAddr) -> Self {
        self.alternate = Some(alternate);
        self
    }

    /// Attach log output to `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Cached NAT type, if a fresh one exists. Never blocks.
    #[must_use]
    pub fn cached(&self) -> Option<NatType> {
        let cached = *self.cache.read();
        cached
            .filter(|c| c.detected_at.elapsed() < self.config.cache_ttl)
            .map(|c| c.nat_type)
    }

    /// Drop the cached result (network change)
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    /// Watch NAT type changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NatType> {
        self.updates.subscribe()
    }

    /// Detect the NAT type, returning the cached value while it is fresh
    ///
    /// # Errors
    ///
    /// Returns `NatError::Io` if the probe socket cannot be bound and
    /// `NatError::Cancelled` if `cancel` fires.
    pub async fn detect(&self, cancel: &CancellationToken) -> Result<NatType, NatError> {
        if let Some(nat_type) = self.cached() {
            return Ok(nat_type);
        }

        let _guard = tokio::select! {
            () = cancel.cancelled() => return Err(NatError::Cancelled),
            guard = self.run_lock.lock() => guard,
        };
        // Another caller may have finished a run while we waited
        if let Some(nat_type) = self.cached() {
            return Ok(nat_type);
        }

        self.run_detection(cancel).await
    }

    /// Ignore the cache and probe again
    ///
    /// # Errors
    ///
    /// See [`detect`](Self::detect).
    pub async fn redetect(&self, cancel: &CancellationToken) -> Result<NatType, NatError> {
        self.invalidate();
        self.detect(cancel).await
    }

    /// Background loop re-detecting every `redetect_interval` until `cancel`
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            loop {
                match self.redetect(&cancel).await {
                    Ok(_) => {}
                    Err(NatError::Cancelled) => break,
                    Err(e) => warn!(error = %e, "NAT detection failed"),
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.redetect_interval) => {}
                }
            }
            debug!("NAT detection loop stopped");
        }
        .instrument(span)
        .await;
    }

    async fn run_detection(&self, cancel: &CancellationToken) -> Result<NatType, NatError> {
        let started = Instant::now();
        let nat_type = self
            .classify(cancel)
            .instrument(self.span.clone())
            .await?;

        // An Unknown result is published but not cached so the next call retries
        if nat_type != NatType::Unknown {
            *self.cache.write() = Some(CachedNat {
                nat_type,
                detected_at: Instant::now(),
            });
        }
        self.updates.send_if_modified(|current| {
            if *current == nat_type {
                return false;
            }
            *current = nat_type;
            true
        });

        self.span.in_scope(|| {
            info!(
                %nat_type,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "NAT type detected"
            );
        });
        Ok(nat_type)
    }

    async fn classify(&self, cancel: &CancellationToken) -> Result<NatType, NatError> {
        let bind_addr = bind_addr_for(self.config.bind_addr, self.primary);
        let client = StunClient::bind(bind_addr, self.config.stun.clone())
            .await?
            .with_span(self.span.clone());

        // Test 1
        let test1 = match client.probe(self.primary, false, false, cancel).await {
            Ok(result) => result,
            Err(StunError::Cancelled) => return Err(NatError::Cancelled),
            Err(e) => {
                debug!(server = %self.primary, error = %e, "test 1 failed, UDP unusable");
                return Ok(NatType::Unknown);
            }
        };

        let local = self.local_socket_addr(&client).await?;
        if test1.mapped == local {
            return Ok(NatType::None);
        }

        // Test 2
        if self
            .changed_response(&client, true, true, cancel)
            .await?
            .is_some()
        {
            return Ok(NatType::FullCone);
        }

        // Test 3
        match self.alternate.or(test1.other_address) {
            Some(second) => match client.probe(second, false, false, cancel).await {
                Ok(test3) if test3.mapped != test1.mapped => {
                    debug!(first = %test1.mapped, second = %test3.mapped, "mapping changed");
                    return Ok(NatType::Symmetric);
                }
                Ok(_) => {}
                Err(StunError::Cancelled) => return Err(NatError::Cancelled),
                Err(e) => debug!(server = %second, error = %e, "test 3 failed"),
            },
            None => debug!("no second server known, skipping symmetric test"),
        }

        // Test 4
        if self
            .changed_response(&client, false, true, cancel)
            .await?
            .is_some()
        {
            Ok(NatType::RestrictedCone)
        } else {
            Ok(NatType::PortRestrictedCone)
        }
    }

    /// Probe with CHANGE-REQUEST. A response only counts when it actually came
    /// from a different address; servers that ignore the attribute answer from
    /// the primary address.
    async fn changed_response(
        &self,
        client: &StunClient,
        change_ip: bool,
        change_port: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<StunProbeResult>, NatError> {
        match client
            .probe(self.primary, change_ip, change_port, cancel)
            .await
        {
            Ok(result) if result.source != self.primary => Ok(Some(result)),
            Ok(result) => {
                debug!(source = %result.source, "server ignored CHANGE-REQUEST");
                Ok(None)
            }
            Err(StunError::Cancelled) => Err(NatError::Cancelled),
            Err(e) => {
                debug!(change_ip, change_port, error = %e, "no changed response");
                Ok(None)
            }
        }
    }

    /// Our socket address as the primary server would see it without a NAT
    async fn local_socket_addr(&self, client: &StunClient) -> Result<SocketAddr, NatError> {
        let bound = client.local_addr()?;
        if !bound.ip().is_unspecified() {
            return Ok(bound);
        }
        let ip = local_ip_toward(self.primary).await?;
        Ok(SocketAddr::new(ip, bound.port()))
    }
}

/// Bind address of the probe socket, matched to the server's family
fn bind_addr_for(configured: SocketAddr, server: SocketAddr) -> SocketAddr {
    if configured.is_ipv4() == server.is_ipv4() || !configured.ip().is_unspecified() {
        return configured;
    }
    let ip: IpAddr = if server.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    SocketAddr::new(ip, configured.port())
}

/// Local IP the kernel would route `server` through
///
/// Connecting a UDP socket only selects the route; nothing is sent.
pub async fn local_ip_toward(server: SocketAddr) -> Result<IpAddr, std::io::Error> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StunConfig;
    use crate::nat::stun::{StunAttribute, StunMessage};
    use std::time::Duration;

    fn quick_config() -> NatDetectorConfig {
        NatDetectorConfig {
            stun: StunConfig {
                timeout: Duration::from_millis(100),
                retries: 0,
                software: None,
            },
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..NatDetectorConfig::default()
        }
    }

    /// Responder that echoes the real source as the mapped address
    async fn echo_responder() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let Ok(request) = StunMessage::decode(&buf[..len]) else {
                    continue;
                };
                let response = StunMessage::binding_response(request.transaction_id)
                    .with_attribute(StunAttribute::XorMappedAddress(from));
                let _ = socket.send_to(&response.encode(), from).await;
            }
        });
        addr
    }

    #[test]
    fn test_nat_type_display() {
        assert_eq!(NatType::None.to_string(), "None (No NAT)");
        assert_eq!(NatType::FullCone.to_string(), "Full Cone NAT");
        assert_eq!(NatType::Symmetric.to_string(), "Symmetric NAT");
        assert_eq!(NatType::Unknown.to_string(), "Unknown NAT Type");
    }

    #[test]
    fn test_punch_friendly() {
        assert!(!NatType::Symmetric.punch_friendly());
        assert!(NatType::Unknown.punch_friendly());
        assert!(NatType::PortRestrictedCone.punch_friendly());
    }

    #[test]
    fn test_bind_addr_follows_server_family() {
        let v4_any: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let v6_server: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        assert!(bind_addr_for(v4_any, v6_server).is_ipv6());

        let pinned: SocketAddr = "192.0.2.4:0".parse().unwrap();
        assert_eq!(bind_addr_for(pinned, v6_server), pinned);
    }

    #[tokio::test]
    async fn test_unreachable_server_yields_unknown() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let detector = NatDetector::new(silent.local_addr().unwrap(), quick_config());

        let nat_type = detector.detect(&CancellationToken::new()).await.unwrap();
        assert_eq!(nat_type, NatType::Unknown);
        // Unknown is not cached
        assert_eq!(detector.cached(), None);
    }

    #[tokio::test]
    async fn test_no_nat_when_mapping_equals_local() {
        let server = echo_responder().await;
        let detector = NatDetector::new(server, quick_config());
        let mut updates = detector.subscribe();

        let nat_type = detector.detect(&CancellationToken::new()).await.unwrap();
        assert_eq!(nat_type, NatType::None);
        assert_eq!(detector.cached(), Some(NatType::None));

        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), NatType::None);

        detector.invalidate();
        assert_eq!(detector.cached(), None);
    }

    #[tokio::test]
    async fn test_detect_cancelled() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let detector = NatDetector::new(silent.local_addr().unwrap(), quick_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            detector.detect(&cancel).await,
            Err(NatError::Cancelled)
        ));
    }
}
