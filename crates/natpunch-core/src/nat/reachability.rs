//! Reachability classification
//!
//! Tracks whether this node accepts unsolicited inbound connections. Signals
//! come from dial-back probes: a helper peer tries to connect back to us and
//! reports the result. A state is only committed after `threshold`
//! consecutive signals in the same direction.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, trace};

use crate::BoxError;
use crate::config::ReachabilityConfig;
use crate::peer::PeerId;

/// Protocol identifier helper peers must support to answer dial-back requests
pub const DIAL_BACK_PROTOCOL: &str = "/natpunch/dial-back/1.0.0";

/// Capacity of the change notification channel
const EVENT_CAPACITY: usize = 16;

/// Coarse reachability of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reachability {
    /// Not enough evidence yet
    #[default]
    Unknown,
    /// Accepts unsolicited inbound connections
    Public,
    /// Needs traversal assistance
    Private,
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
        }
    }
}

/// Emitted once per committed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityChanged {
    /// State before the transition
    pub previous: Reachability,
    /// State after the transition
    pub current: Reachability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Success,
    Failure,
}

#[derive(Debug)]
struct State {
    reachability: Reachability,
    confidence: u32,
    direction: Option<Direction>,
    locked: bool,
}

/// Confidence-based reachability state machine
pub struct ReachabilityClassifier {
    threshold: u32,
    state: Mutex<State>,
    events: broadcast::Sender<ReachabilityChanged>,
    span: Span,
}

impl ReachabilityClassifier {
    /// Create a classifier in the `Unknown` state
    ///
    /// A zero threshold is treated as 1.
    #[must_use]
    pub fn new(config: &ReachabilityConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let classifier = Self {
            threshold: config.confidence_threshold.max(1),
            state: Mutex::new(State {
                reachability: Reachability::Unknown,
                confidence: 0,
                direction: None,
                locked: false,
            }),
            events,
            span: Span::none(),
        };
        if config.lock_public {
            classifier.lock_public();
        }
        classifier
    }

    /// Attach log output to `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Current state
    #[must_use]
    pub fn reachability(&self) -> Reachability {
        self.state.lock().reachability
    }

    /// Whether the node is administratively locked to `Public`
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Current confidence in the last signal direction
    #[must_use]
    pub fn confidence(&self) -> u32 {
        self.state.lock().confidence
    }

    /// Receive state change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReachabilityChanged> {
        self.events.subscribe()
    }

    /// Record a successful dial-back
    pub fn record_success(&self) -> Option<ReachabilityChanged> {
        self.record(Direction::Success)
    }

    /// Record a failed dial-back
    pub fn record_failure(&self) -> Option<ReachabilityChanged> {
        self.record(Direction::Failure)
    }

    fn record(&self, direction: Direction) -> Option<ReachabilityChanged> {
        let change = {
            let mut state = self.state.lock();
            if state.direction == Some(direction) {
                state.confidence = state.confidence.saturating_add(1);
            } else {
                state.direction = Some(direction);
                state.confidence = 1;
            }
            trace!(
                parent: &self.span,
                ?direction,
                confidence = state.confidence,
                "reachability signal"
            );

            if state.confidence < self.threshold {
                return None;
            }
            let target = match direction {
                Direction::Success => Reachability::Public,
                Direction::Failure => Reachability::Private,
            };
            Self::transition(&mut state, target)?
        };
        self.publish(change);
        Some(change)
    }

    /// Lock the node to `Public`; later downgrades are ignored
    pub fn lock_public(&self) -> Option<ReachabilityChanged> {
        let change = {
            let mut state = self.state.lock();
            state.locked = true;
            Self::transition(&mut state, Reachability::Public)?
        };
        self.publish(change);
        Some(change)
    }

    /// Override the state, resetting accumulated confidence
    ///
    /// Ignored when locked and `reachability` is not `Public`.
    pub fn set_reachability(&self, reachability: Reachability) -> Option<ReachabilityChanged> {
        let change = {
            let mut state = self.state.lock();
            state.confidence = 0;
            state.direction = None;
            Self::transition(&mut state, reachability)?
        };
        self.publish(change);
        Some(change)
    }

    fn transition(state: &mut State, target: Reachability) -> Option<ReachabilityChanged> {
        if state.locked && target != Reachability::Public {
            return None;
        }
        if state.reachability == target {
            return None;
        }
        let previous = std::mem::replace(&mut state.reachability, target);
        Some(ReachabilityChanged {
            previous,
            current: target,
        })
    }

    fn publish(&self, change: ReachabilityChanged) {
        info!(
            parent: &self.span,
            previous = %change.previous,
            current = %change.current,
            "reachability changed"
        );
        // No subscribers is fine
        let _ = self.events.send(change);
    }
}

/// Result reported by a helper peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialBackOutcome {
    /// The helper connected back to us
    Reachable,
    /// The helper could not connect back
    Unreachable,
}

/// Source of candidate helper peers
pub trait PeerDirectory: Send + Sync {
    /// Currently connected peers
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Whether `peer` is known to speak `protocol`
    fn supports_protocol(&self, peer: &PeerId, protocol: &str) -> bool;
}

/// Sends dial-back requests to helper peers
#[async_trait]
pub trait DialBackClient: Send + Sync {
    /// Ask `peer` to dial us back
    ///
    /// An error means the request itself failed and says nothing about our
    /// reachability.
    async fn request_dial_back(
        &self,
        peer: &PeerId,
        cancel: &CancellationToken,
    ) -> Result<DialBackOutcome, BoxError>;
}

/// Background loop feeding dial-back results into a classifier
pub struct ReachabilityProber {
    classifier: Arc<ReachabilityClassifier>,
    peers: Arc<dyn PeerDirectory>,
    client: Arc<dyn DialBackClient>,
    config: ReachabilityConfig,
    span: Span,
}

impl ReachabilityProber {
    /// Create a prober
    #[must_use]
    pub fn new(
        classifier: Arc<ReachabilityClassifier>,
        peers: Arc<dyn PeerDirectory>,
        client: Arc<dyn DialBackClient>,
        config: ReachabilityConfig,
    ) -> Self {
        Self {
            classifier,
            peers,
            client,
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

    /// Pick helpers for one round: peers supporting the dial-back protocol,
    /// or a random sample of all connected peers if none do
    #[must_use]
    pub fn select_peers(&self) -> Vec<PeerId> {
        let connected = self.peers.connected_peers();
        let supporting: Vec<PeerId> = connected
            .iter()
            .filter(|p| self.peers.supports_protocol(p, DIAL_BACK_PROTOCOL))
            .cloned()
            .collect();
        let pool = if supporting.is_empty() {
            connected
        } else {
            supporting
        };

        let mut rng = rand::thread_rng();
        pool.choose_multiple(&mut rng, self.config.peers_per_round)
            .cloned()
            .collect()
    }

    /// Run one probe round and return the number of conclusive answers
    pub async fn probe_once(&self, cancel: &CancellationToken) -> usize {
        self.probe_round(cancel)
            .instrument(self.span.clone())
            .await
    }

    async fn probe_round(&self, cancel: &CancellationToken) -> usize {
        let peers = self.select_peers();
        if peers.is_empty() {
            debug!("no peers available for dial-back");
            return 0;
        }

        let round = cancel.child_token();
        let mut tasks = JoinSet::new();
        for peer in peers {
            let client = Arc::clone(&self.client);
            let token = round.clone();
            let timeout = self.config.dial_back_timeout;
            tasks.spawn(async move {
                let request =
                    tokio::time::timeout(timeout, client.request_dial_back(&peer, &token));
                let result = tokio::select! {
                    () = token.cancelled() => None,
                    r = request => Some(r),
                };
                (peer, result)
            });
        }

        let mut conclusive = 0;
        while let Some(joined) = tasks.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            match result {
                Some(Ok(Ok(DialBackOutcome::Reachable))) => {
                    debug!(peer = %peer.short(), "dial-back succeeded");
                    self.classifier.record_success();
                    conclusive += 1;
                }
                Some(Ok(Ok(DialBackOutcome::Unreachable))) => {
                    debug!(peer = %peer.short(), "dial-back failed");
                    self.classifier.record_failure();
                    conclusive += 1;
                }
                Some(Ok(Err(e))) => {
                    debug!(peer = %peer.short(), error = %e, "dial-back request inconclusive");
                }
                Some(Err(_)) => {
                    debug!(peer = %peer.short(), "dial-back request timed out");
                }
                None => {}
            }
        }
        round.cancel();
        conclusive
    }

    /// Probe every `probe_interval` until `cancel`. Locked nodes skip rounds.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            loop {
                if !self.classifier.is_locked() {
                    self.probe_round(&cancel).await;
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.probe_interval) => {}
                }
            }
            debug!("reachability prober stopped");
        }
        .instrument(span)
        .await;
    }
}
