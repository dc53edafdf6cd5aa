//! Punch session table
//!
//! At most one live punch per remote peer. Each session carries a one-shot
//! completion: the first terminal write wins and later writes are no-ops,
//! so a timeout racing a success cannot overwrite or double-fire it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::protocol::NONCE_LEN;
use crate::peer::PeerId;

/// Terminal result of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Direct path established to this address
    Connected(SocketAddr),
    /// Punch failed
    Failed(String),
}

/// One in-flight punch attempt
#[derive(Debug)]
pub struct PunchSession {
    peer: PeerId,
    nonce: [u8; NONCE_LEN],
    candidates: Mutex<Vec<SocketAddr>>,
    started_at: Instant,
    done: watch::Sender<Option<SessionOutcome>>,
}

impl PunchSession {
    fn new(peer: PeerId, nonce: [u8; NONCE_LEN]) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            peer,
            nonce,
            candidates: Mutex::new(Vec::new()),
            started_at: Instant::now(),
            done,
        }
    }

    /// Remote peer
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Session nonce
    #[must_use]
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Time since the session was created
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Remote candidates learned so far
    #[must_use]
    pub fn candidates(&self) -> Vec<SocketAddr> {
        self.candidates.lock().clone()
    }

    /// Record the remote candidates
    pub fn set_candidates(&self, candidates: Vec<SocketAddr>) {
        *self.candidates.lock() = candidates;
    }

    /// Set the terminal result. Returns `false` if one was already set.
    pub fn complete(&self, outcome: SessionOutcome) -> bool {
        self.done.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Whether a terminal result is set
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Terminal result, if set
    #[must_use]
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.done.borrow().clone()
    }

    /// Wait for the terminal result. Any number of callers may wait.
    pub async fn wait(&self) -> SessionOutcome {
        let mut rx = self.done.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| SessionOutcome::Failed("session closed".into())),
            // The sender lives in `self`, so this is unreachable while borrowed
            Err(_) => SessionOutcome::Failed("session closed".into()),
        }
    }
}

/// Concurrent registry of live sessions keyed by peer
#[derive(Debug, Default)]
pub struct PunchSessionTable {
    sessions: DashMap<PeerId, Arc<PunchSession>>,
}

impl PunchSessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `peer` unless one is live
    ///
    /// # Errors
    ///
    /// Returns the existing session if `peer` already has one.
    pub fn create(
        &self,
        peer: &PeerId,
        nonce: [u8; NONCE_LEN],
    ) -> Result<Arc<PunchSession>, Arc<PunchSession>> {
        match self.sessions.entry(peer.clone()) {
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let session = Arc::new(PunchSession::new(peer.clone(), nonce));
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Live session for `peer`
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<Arc<PunchSession>> {
        self.sessions.get(peer).map(|s| Arc::clone(s.value()))
    }

    /// Complete the live session for `peer`. Returns `false` if there is none
    /// or it was already completed.
    pub fn complete(&self, peer: &PeerId, outcome: SessionOutcome) -> bool {
        self.get(peer).is_some_and(|s| s.complete(outcome))
    }

    /// Remove `session` if it is still the one registered for its peer
    pub fn remove(&self, session: &Arc<PunchSession>) -> bool {
        self.sessions
            .remove_if(&session.peer, |_, live| Arc::ptr_eq(live, session))
            .is_some()
    }

    /// Whether `peer` has a live session
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tie `session` to a guard that fails and removes it on drop
    #[must_use]
    pub fn guard(&self, session: Arc<PunchSession>) -> SessionGuard<'_> {
        SessionGuard {
            table: self,
            session,
        }
    }
}

/// Removes its session when dropped, failing it first if still pending
///
/// Covers early returns and caller cancellation (future dropped).
pub struct SessionGuard<'a> {
    table: &'a PunchSessionTable,
    session: Arc<PunchSession>,
}

impl SessionGuard<'_> {
    /// Guarded session
    #[must_use]
    pub fn session(&self) -> &Arc<PunchSession> {
        &self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session
            .complete(SessionOutcome::Failed("session abandoned".into()));
        self.table.remove(&self.session);
    }
}
