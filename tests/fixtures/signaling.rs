//! In-memory signaling between coordinators in one process
//!
//! `open_stream` creates a duplex pipe and hands the far end to the remote
//! coordinator's `handle_inbound`, the way an application's relay handler
//! would. Inbound results are published on a channel per receiving peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use natpunch_core::punch::{
    AddressSource, BoxStream, DirectConnection, HOLE_PUNCH_PROTOCOL, PunchCoordinator,
    PunchError, Signaling,
};
use natpunch_core::{BoxError, PeerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result of an inbound negotiation on some peer
pub type InboundResult = Result<DirectConnection, PunchError>;

/// Registry of coordinators reachable through memory signaling
#[derive(Default)]
pub struct MemoryNetwork {
    peers: Mutex<HashMap<PeerId, Arc<PunchCoordinator>>>,
    inbound: Mutex<HashMap<PeerId, mpsc::UnboundedSender<InboundResult>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signaling handle for `local`
    pub fn signaling(self: &Arc<Self>, local: &str) -> Arc<MemorySignaling> {
        Arc::new(MemorySignaling {
            local: PeerId::from(local),
            network: Arc::clone(self),
        })
    }

    /// Make `coordinator` reachable; returns its inbound results
    pub fn register(
        &self,
        coordinator: Arc<PunchCoordinator>,
    ) -> mpsc::UnboundedReceiver<InboundResult> {
        let id = coordinator.local_id().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound.lock().unwrap().insert(id.clone(), tx);
        self.peers.lock().unwrap().insert(id, coordinator);
        rx
    }
}

/// Signaling for one peer on a [`MemoryNetwork`]
pub struct MemorySignaling {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
        cancel: &CancellationToken,
    ) -> Result<BoxStream, BoxError> {
        if protocol != HOLE_PUNCH_PROTOCOL {
            return Err(format!("unsupported protocol {protocol}").into());
        }
        let remote = self
            .network
            .peers
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| format!("{peer} not connected"))?;
        let results = self.network.inbound.lock().unwrap().get(peer).cloned();

        let (ours, theirs) = tokio::io::duplex(4096);
        let from = self.local.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = remote.handle_inbound(&from, Box::new(theirs), &cancel).await;
            if let Some(results) = results {
                let _ = results.send(result);
            }
        });
        Ok(Box::new(ours))
    }
}

/// Fixed address source: everything offered as STUN-observed
pub struct StaticAddresses(pub Vec<SocketAddr>);

impl AddressSource for StaticAddresses {
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
