//! Scripted STUN server for NAT classification scenarios
//!
//! Three loopback sockets stand in for a RFC 3489 server with two
//! addresses:
//! - `primary` answers plain Binding Requests
//! - `changed` answers CHANGE-REQUEST(change-IP, change-port) and plain
//!   requests sent to it directly (the second server of Test 3)
//! - `changed_port` answers CHANGE-REQUEST(change-port)
//!
//! The script decides which of these answer and which mapped address each
//! reports, simulating what a NAT in front of the client would produce.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use natpunch_core::nat::{StunAttribute, StunMessage};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Behavior of the simulated NAT and server
#[derive(Debug, Clone)]
pub struct StunScript {
    /// Address reported by the primary server
    pub mapped: SocketAddr,
    /// Address reported by the second server; `None` reuses `mapped`
    pub second_mapped: Option<SocketAddr>,
    /// Whether a change-IP/port response gets through the NAT (Test 2)
    pub answer_change_ip: bool,
    /// Whether a change-port response gets through the NAT (Test 4)
    pub answer_change_port: bool,
    /// Include OTHER-ADDRESS pointing at the second server
    pub advertise_other: bool,
}

impl Default for StunScript {
    fn default() -> Self {
        Self {
            mapped: "203.0.113.5:40000".parse().unwrap(),
            second_mapped: None,
            answer_change_ip: false,
            answer_change_port: false,
            advertise_other: true,
        }
    }
}

/// Running scripted server; stops when dropped
pub struct ScriptedStunServer {
    /// Primary server address
    pub primary: SocketAddr,
    /// Second server address (change-IP source)
    pub changed: SocketAddr,
    /// Change-port source address
    pub changed_port: SocketAddr,
    requests: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl ScriptedStunServer {
    /// Bind the sockets and start answering according to `script`
    pub async fn start(script: StunScript) -> std::io::Result<Self> {
        let primary = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let changed = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let changed_port = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);

        let server = Self {
            primary: primary.local_addr()?,
            changed: changed.local_addr()?,
            changed_port: changed_port.local_addr()?,
            requests: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        };

        let other = server.changed;
        tokio::spawn(serve_primary(
            Arc::clone(&primary),
            Arc::clone(&changed),
            Arc::clone(&changed_port),
            script.clone(),
            other,
            Arc::clone(&server.requests),
            server.cancel.clone(),
        ));
        tokio::spawn(serve_second(
            changed,
            script.second_mapped.unwrap_or(script.mapped),
            Arc::clone(&server.requests),
            server.cancel.clone(),
        ));

        Ok(server)
    }

    /// Requests received across all sockets
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedStunServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn response(request: &StunMessage, mapped: SocketAddr, origin: SocketAddr) -> Vec<u8> {
    StunMessage::binding_response(request.transaction_id)
        .with_attribute(StunAttribute::XorMappedAddress(mapped))
        .with_attribute(StunAttribute::ResponseOrigin(origin))
        .encode()
}

async fn serve_primary(
    socket: Arc<UdpSocket>,
    changed: Arc<UdpSocket>,
    changed_port: Arc<UdpSocket>,
    script: StunScript,
    other: SocketAddr,
    requests: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = tokio::select! {
            () = cancel.cancelled() => return,
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(_) => return,
            },
        };
        let Ok(request) = StunMessage::decode(&buf[..len]) else {
            continue;
        };
        requests.fetch_add(1, Ordering::SeqCst);

        let (reply_from, allowed) = match request.change_request() {
            Some((true, _)) => (&changed, script.answer_change_ip),
            Some((false, true)) => (&changed_port, script.answer_change_port),
            _ => (&socket, true),
        };
        if !allowed {
            continue;
        }

        let origin = reply_from.local_addr().unwrap();
        let mut reply = StunMessage::binding_response(request.transaction_id)
            .with_attribute(StunAttribute::XorMappedAddress(script.mapped))
            .with_attribute(StunAttribute::ResponseOrigin(origin));
        if script.advertise_other {
            reply.add_attribute(StunAttribute::OtherAddress(other));
        }
        let _ = reply_from.send_to(&reply.encode(), from).await;
    }
}

async fn serve_second(
    socket: Arc<UdpSocket>,
    mapped: SocketAddr,
    requests: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let origin = socket.local_addr().unwrap();
    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = tokio::select! {
            () = cancel.cancelled() => return,
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(_) => return,
            },
        };
        let Ok(request) = StunMessage::decode(&buf[..len]) else {
            continue;
        };
        requests.fetch_add(1, Ordering::SeqCst);
        let _ = socket
            .send_to(&response(&request, mapped, origin), from)
            .await;
    }
}
