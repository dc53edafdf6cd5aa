//! STUN Protocol Implementation (RFC 5389 subset)
//!
//! Binding requests and responses only. The codec understands the address
//! attributes needed for NAT type discrimination, including the legacy
//! RFC 3489 forms (`SOURCE-ADDRESS`, `CHANGED-ADDRESS`) that older servers
//! still emit, and the `CHANGE-REQUEST` attribute.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::RngCore;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, trace};

use crate::config::StunConfig;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Receive buffer size; Binding responses are far smaller
const RECV_BUFFER_SIZE: usize = 1024;

/// Attribute type codes
pub mod attr {
    /// MAPPED-ADDRESS
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    /// CHANGE-REQUEST (RFC 3489 / RFC 5780)
    pub const CHANGE_REQUEST: u16 = 0x0003;
    /// SOURCE-ADDRESS (RFC 3489)
    pub const SOURCE_ADDRESS: u16 = 0x0004;
    /// CHANGED-ADDRESS (RFC 3489)
    pub const CHANGED_ADDRESS: u16 = 0x0005;
    /// XOR-MAPPED-ADDRESS
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    /// SOFTWARE
    pub const SOFTWARE: u16 = 0x8022;
    /// RESPONSE-ORIGIN (RFC 5780)
    pub const RESPONSE_ORIGIN: u16 = 0x802b;
    /// OTHER-ADDRESS (RFC 5780)
    pub const OTHER_ADDRESS: u16 = 0x802c;
}

const CHANGE_IP_FLAG: u8 = 0x04;
const CHANGE_PORT_FLAG: u8 = 0x02;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN message method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Encode method and class into the 16-bit message type field
    ///
    /// RFC 5389 Section 6 interleaves the class bits into the method:
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    fn encode(self, class: StunMessageClass) -> u16 {
        let method: u16 = match self {
            Self::Binding => 0x0001,
        };

        let class_bits: u16 = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        let m0_m3 = method & 0x0F;
        let c0 = (class_bits & 0x01) << 4;
        let m4_m6 = (method & 0x70) << 1;
        let c1 = (class_bits & 0x02) << 7;
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }

    fn decode(msg_type: u16) -> Result<(Self, StunMessageClass), InvalidResponse> {
        // Two most significant bits must be zero for STUN
        if msg_type & 0xC000 != 0 {
            return Err(InvalidResponse::MessageType(msg_type));
        }

        let c0 = (msg_type >> 4) & 0x01;
        let c1 = (msg_type >> 8) & 0x01;
        let class = match c0 | (c1 << 1) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let method = (msg_type & 0x0F) | ((msg_type >> 1) & 0x70) | ((msg_type >> 2) & 0xF80);
        match method {
            0x0001 => Ok((Self::Binding, class)),
            _ => Err(InvalidResponse::MessageType(msg_type)),
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001)
    MappedAddress(SocketAddr),
    /// XOR-MAPPED-ADDRESS (0x0020), preferred over MAPPED-ADDRESS
    XorMappedAddress(SocketAddr),
    /// CHANGE-REQUEST (0x0003)
    ChangeRequest {
        /// Ask the server to answer from its alternate IP
        change_ip: bool,
        /// Ask the server to answer from its alternate port
        change_port: bool,
    },
    /// SOURCE-ADDRESS (0x0004), legacy form of RESPONSE-ORIGIN
    SourceAddress(SocketAddr),
    /// CHANGED-ADDRESS (0x0005), legacy form of OTHER-ADDRESS
    ChangedAddress(SocketAddr),
    /// RESPONSE-ORIGIN (0x802b)
    ResponseOrigin(SocketAddr),
    /// OTHER-ADDRESS (0x802c)
    OtherAddress(SocketAddr),
    /// SOFTWARE (0x8022)
    Software(String),
    /// Attribute this codec does not interpret
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    /// Attribute type code
    #[must_use]
    pub fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => attr::MAPPED_ADDRESS,
            Self::ChangeRequest { .. } => attr::CHANGE_REQUEST,
            Self::SourceAddress(_) => attr::SOURCE_ADDRESS,
            Self::ChangedAddress(_) => attr::CHANGED_ADDRESS,
            Self::XorMappedAddress(_) => attr::XOR_MAPPED_ADDRESS,
            Self::Software(_) => attr::SOFTWARE,
            Self::ResponseOrigin(_) => attr::RESPONSE_ORIGIN,
            Self::OtherAddress(_) => attr::OTHER_ADDRESS,
            Self::Unknown(t, _) => *t,
        }
    }

    /// Append the TLV encoding (with padding) to `out`
    fn encode_into(&self, transaction_id: &[u8; 12], out: &mut Vec<u8>) {
        let value = self.encode_value(transaction_id);

        out.extend_from_slice(&self.attr_type().to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(&value);

        let padding = (4 - (value.len() % 4)) % 4;
        out.extend(std::iter::repeat_n(0, padding));
    }

    fn encode_value(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr)
            | Self::SourceAddress(addr)
            | Self::ChangedAddress(addr)
            | Self::ResponseOrigin(addr)
            | Self::OtherAddress(addr) => encode_plain_address(*addr),
            Self::XorMappedAddress(addr) => encode_xor_address(*addr, transaction_id),
            Self::ChangeRequest {
                change_ip,
                change_port,
            } => {
                let mut flags = 0u8;
                if *change_ip {
                    flags |= CHANGE_IP_FLAG;
                }
                if *change_port {
                    flags |= CHANGE_PORT_FLAG;
                }
                vec![0, 0, 0, flags]
            }
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    /// Decode one attribute value
    fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &[u8; 12],
    ) -> Result<Self, InvalidResponse> {
        let attr = match attr_type {
            attr::MAPPED_ADDRESS => Self::MappedAddress(decode_plain_address(value)?),
            attr::SOURCE_ADDRESS => Self::SourceAddress(decode_plain_address(value)?),
            attr::CHANGED_ADDRESS => Self::ChangedAddress(decode_plain_address(value)?),
            attr::RESPONSE_ORIGIN => Self::ResponseOrigin(decode_plain_address(value)?),
            attr::OTHER_ADDRESS => Self::OtherAddress(decode_plain_address(value)?),
            attr::XOR_MAPPED_ADDRESS => {
                Self::XorMappedAddress(decode_xor_address(value, transaction_id)?)
            }
            attr::CHANGE_REQUEST => {
                if value.len() != 4 {
                    return Err(InvalidResponse::TruncatedAttribute(attr_type));
                }
                Self::ChangeRequest {
                    change_ip: value[3] & CHANGE_IP_FLAG != 0,
                    change_port: value[3] & CHANGE_PORT_FLAG != 0,
                }
            }
            attr::SOFTWARE => Self::Software(String::from_utf8_lossy(value).into_owned()),
            _ => Self::Unknown(attr_type, value.to_vec()),
        };
        Ok(attr)
    }
}

fn encode_plain_address(addr: SocketAddr) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }
    value
}

fn decode_plain_address(value: &[u8]) -> Result<SocketAddr, InvalidResponse> {
    if value.len() < 4 {
        return Err(InvalidResponse::TruncatedAddress);
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        FAMILY_IPV4 => {
            let octets: [u8; 4] = value
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(InvalidResponse::TruncatedAddress)?;
            Ok(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        FAMILY_IPV6 => {
            let octets: [u8; 16] = value
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(InvalidResponse::TruncatedAddress)?;
            Ok(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        family => Err(InvalidResponse::UnsupportedFamily(family)),
    }
}

/// XOR key: magic cookie, followed by the transaction ID for IPv6
fn xor_key(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let key = xor_key(transaction_id);
    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&xor_port.to_be_bytes());
            value.extend(ip.octets().iter().zip(&key[..4]).map(|(b, k)| b ^ k));
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&xor_port.to_be_bytes());
            value.extend(ip.octets().iter().zip(&key).map(|(b, k)| b ^ k));
        }
    }
    value
}

fn decode_xor_address(
    value: &[u8],
    transaction_id: &[u8; 12],
) -> Result<SocketAddr, InvalidResponse> {
    if value.len() < 4 {
        return Err(InvalidResponse::TruncatedAddress);
    }
    let key = xor_key(transaction_id);
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match value[1] {
        FAMILY_IPV4 => {
            let raw = value.get(4..8).ok_or(InvalidResponse::TruncatedAddress)?;
            let mut octets = [0u8; 4];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = b ^ key[i];
            }
            Ok(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        FAMILY_IPV6 => {
            let raw = value.get(4..20).ok_or(InvalidResponse::TruncatedAddress)?;
            let mut octets = [0u8; 16];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = b ^ key[i];
            }
            Ok(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        family => Err(InvalidResponse::UnsupportedFamily(family)),
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message method
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// Attributes in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a Binding Request with a random transaction ID
    #[must_use]
    pub fn binding_request() -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create an empty Binding Success Response for `transaction_id`
    #[must_use]
    pub fn binding_response(transaction_id: [u8; 12]) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Builder form of [`add_attribute`](Self::add_attribute)
    #[must_use]
    pub fn with_attribute(mut self, attr: StunAttribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 64);

        bytes.extend_from_slice(&self.message_type.encode(self.message_class).to_be_bytes());
        // Length is patched once attributes are written
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            attr.encode_into(&self.transaction_id, &mut bytes);
        }

        let body_len = (bytes.len() - HEADER_SIZE) as u16;
        bytes[2..4].copy_from_slice(&body_len.to_be_bytes());

        bytes
    }

    /// Decode message from bytes
    ///
    /// Unknown attributes are kept as [`StunAttribute::Unknown`] and skipped
    /// by their declared length (rounded up to a 4-byte boundary).
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` on a short header, bad magic cookie, unknown
    /// method, a declared length that exceeds the buffer, a truncated
    /// attribute or an unsupported address family.
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidResponse> {
        if bytes.len() < HEADER_SIZE {
            return Err(InvalidResponse::TooShort(bytes.len()));
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if cookie != MAGIC_COOKIE {
            return Err(InvalidResponse::MagicCookie(cookie));
        }

        let (message_type, message_class) = StunMessageType::decode(msg_type)?;

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..HEADER_SIZE]);

        let end = HEADER_SIZE + body_len;
        if bytes.len() < end {
            return Err(InvalidResponse::LengthMismatch {
                declared: body_len,
                available: bytes.len() - HEADER_SIZE,
            });
        }

        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < end {
            if offset + 4 > end {
                return Err(InvalidResponse::TruncatedAttribute(0));
            }
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_len > end {
                return Err(InvalidResponse::TruncatedAttribute(attr_type));
            }
            let value = &bytes[offset..offset + attr_len];
            attributes.push(StunAttribute::decode(attr_type, value, &transaction_id)?);

            // The final attribute's padding may be omitted by sloppy servers
            offset = (offset + attr_len + 3) & !3;
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// Mapped address, preferring XOR-MAPPED-ADDRESS over MAPPED-ADDRESS
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.find(|a| match a {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
        .or_else(|| {
            self.find(|a| match a {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// RESPONSE-ORIGIN, or legacy SOURCE-ADDRESS
    #[must_use]
    pub fn response_origin(&self) -> Option<SocketAddr> {
        self.find(|a| match a {
            StunAttribute::ResponseOrigin(addr) | StunAttribute::SourceAddress(addr) => {
                Some(*addr)
            }
            _ => None,
        })
    }

    /// OTHER-ADDRESS, or legacy CHANGED-ADDRESS
    #[must_use]
    pub fn other_address(&self) -> Option<SocketAddr> {
        self.find(|a| match a {
            StunAttribute::OtherAddress(addr) | StunAttribute::ChangedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// CHANGE-REQUEST flags, if present
    #[must_use]
    pub fn change_request(&self) -> Option<(bool, bool)> {
        self.find(|a| match a {
            StunAttribute::ChangeRequest {
                change_ip,
                change_port,
            } => Some((*change_ip, *change_port)),
            _ => None,
        })
    }

    fn find<T>(&self, f: impl FnMut(&StunAttribute) -> Option<T>) -> Option<T> {
        self.attributes.iter().find_map(f)
    }

    /// Validate this message as the answer to `transaction_id` and extract
    /// the probe result
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` if the message is not a Binding Success
    /// Response, echoes a different transaction ID, or carries no mapped
    /// address.
    pub fn into_probe_result(
        self,
        transaction_id: &[u8; 12],
        source: SocketAddr,
    ) -> Result<StunProbeResult, InvalidResponse> {
        if self.transaction_id != *transaction_id {
            return Err(InvalidResponse::TransactionMismatch);
        }
        match self.message_class {
            StunMessageClass::SuccessResponse => {}
            StunMessageClass::ErrorResponse => return Err(InvalidResponse::ErrorResponse),
            _ => return Err(InvalidResponse::NotAResponse),
        }
        let mapped = self
            .mapped_address()
            .ok_or(InvalidResponse::MissingMappedAddress)?;

        Ok(StunProbeResult {
            mapped,
            response_origin: self.response_origin(),
            other_address: self.other_address(),
            transaction_id: self.transaction_id,
            source,
        })
    }
}

/// Result of one Binding probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunProbeResult {
    /// Our address as seen by the server
    pub mapped: SocketAddr,
    /// Address the server says it answered from
    pub response_origin: Option<SocketAddr>,
    /// Server's alternate address, if it advertises one
    pub other_address: Option<SocketAddr>,
    /// Transaction ID of the exchange
    pub transaction_id: [u8; 12],
    /// Address the response datagram actually came from
    pub source: SocketAddr,
}

/// Reasons a datagram is not an acceptable STUN response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidResponse {
    /// Shorter than the 20-byte header
    #[error("message too short ({0} bytes)")]
    TooShort(usize),

    /// Magic cookie mismatch
    #[error("bad magic cookie {0:#010x}")]
    MagicCookie(u32),

    /// Unknown method or non-STUN type bits
    #[error("unsupported message type {0:#06x}")]
    MessageType(u16),

    /// Header length exceeds the datagram
    #[error("declared length {declared} exceeds {available} available bytes")]
    LengthMismatch {
        /// Declared body length
        declared: usize,
        /// Body bytes actually present
        available: usize,
    },

    /// Attribute runs past the end of the message
    #[error("truncated attribute {0:#06x}")]
    TruncatedAttribute(u16),

    /// Address attribute value too short for its family
    #[error("truncated address attribute")]
    TruncatedAddress,

    /// Address family other than IPv4/IPv6
    #[error("unsupported address family {0:#04x}")]
    UnsupportedFamily(u8),

    /// Transaction ID does not echo the request
    #[error("transaction ID mismatch")]
    TransactionMismatch,

    /// Binding Error Response
    #[error("error response")]
    ErrorResponse,

    /// Request or indication where a response was expected
    #[error("not a response")]
    NotAResponse,

    /// Success response without any mapped address
    #[error("missing mapped address")]
    MissingMappedAddress,
}

/// STUN probe error
#[derive(Debug, Error)]
pub enum StunError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No response within the timeout, after all retransmissions
    #[error("STUN query timeout")]
    Timeout,

    /// Only invalid responses were received
    #[error("invalid STUN response: {0}")]
    Invalid(#[from] InvalidResponse),

    /// Caller cancelled the probe
    #[error("STUN probe cancelled")]
    Cancelled,
}

impl StunError {
    /// The server did not answer (timeout or invalid-only traffic)
    #[must_use]
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::Timeout | Self::Invalid(_))
    }
}

/// STUN client bound to one UDP socket
///
/// Reusing one client for several probes keeps the local mapping stable,
/// which NAT type discrimination depends on.
pub struct StunClient {
    socket: UdpSocket,
    config: StunConfig,
    span: Span,
}

impl StunClient {
    /// Bind a new STUN client to a local address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound
    pub async fn bind(addr: SocketAddr, config: StunConfig) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Wrap an existing socket
    #[must_use]
    pub fn from_socket(socket: UdpSocket, config: StunConfig) -> Self {
        Self {
            socket,
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

    /// Get local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Release the underlying socket
    #[must_use]
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }

    /// Send a Binding Request, optionally with CHANGE-REQUEST, and wait for
    /// the matching response
    ///
    /// Datagrams that fail to decode or echo a different transaction ID are
    /// ignored while waiting. The request is retransmitted `retries` times,
    /// each transmission waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// - `StunError::Cancelled` when `cancel` fires
    /// - `StunError::Invalid` if only invalid responses arrived, or the
    ///   server answered with a Binding Error Response
    /// - `StunError::Timeout` if nothing arrived
    /// - `StunError::Io` on socket failure
    pub async fn probe(
        &self,
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
        cancel: &CancellationToken,
    ) -> Result<StunProbeResult, StunError> {
        self.probe_inner(server, change_ip, change_port, cancel)
            .instrument(self.span.clone())
            .await
    }

    async fn probe_inner(
        &self,
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
        cancel: &CancellationToken,
    ) -> Result<StunProbeResult, StunError> {
        let mut request = StunMessage::binding_request();
        if change_ip || change_port {
            request.add_attribute(StunAttribute::ChangeRequest {
                change_ip,
                change_port,
            });
        }
        if let Some(software) = &self.config.software {
            request.add_attribute(StunAttribute::Software(software.clone()));
        }
        let transaction_id = request.transaction_id;
        let request_bytes = request.encode();

        let mut last_invalid = None;
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        for attempt in 0..=self.config.retries {
            if cancel.is_cancelled() {
                return Err(StunError::Cancelled);
            }
            trace!(%server, attempt, change_ip, change_port, "sending binding request");
            self.socket.send_to(&request_bytes, server).await?;

            let deadline = Instant::now() + self.config.timeout;
            loop {
                let received = tokio::select! {
                    () = cancel.cancelled() => return Err(StunError::Cancelled),
                    r = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)) => r,
                };
                // Attempt timed out, retransmit
                let Ok(received) = received else { break };
                let (len, from) = received?;

                let outcome = StunMessage::decode(&buf[..len])
                    .and_then(|msg| msg.into_probe_result(&transaction_id, from));
                match outcome {
                    Ok(result) => {
                        debug!(
                            %server,
                            mapped = %result.mapped,
                            source = %from,
                            "binding response"
                        );
                        return Ok(result);
                    }
                    Err(InvalidResponse::ErrorResponse) => {
                        return Err(InvalidResponse::ErrorResponse.into());
                    }
                    Err(err) => {
                        trace!(%from, error = %err, "ignoring datagram");
                        last_invalid = Some(err);
                    }
                }
            }
        }

        Err(last_invalid.map_or(StunError::Timeout, StunError::Invalid))
    }

    /// Get the mapped address from a plain Binding probe
    ///
    /// # Errors
    ///
    /// See [`probe`](Self::probe).
    pub async fn get_mapped_address(
        &self,
        server: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<SocketAddr, StunError> {
        Ok(self.probe(server, false, false, cancel).await?.mapped)
    }

    /// One probe over a fresh UDP socket bound to an ephemeral port
    ///
    /// # Errors
    ///
    /// See [`probe`](Self::probe).
    pub async fn probe_once(
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
        config: StunConfig,
        cancel: &CancellationToken,
    ) -> Result<StunProbeResult, StunError> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let client = Self::bind(bind, config).await?;
        client.probe(server, change_ip, change_port, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_config() -> StunConfig {
        StunConfig {
            timeout: Duration::from_millis(100),
            retries: 1,
            software: None,
        }
    }

    #[test]
    fn test_stun_message_type_encoding() {
        assert_eq!(
            StunMessageType::Binding.encode(StunMessageClass::Request),
            0x0001
        );
        assert_eq!(
            StunMessageType::Binding.encode(StunMessageClass::SuccessResponse),
            0x0101
        );
        assert_eq!(
            StunMessageType::Binding.encode(StunMessageClass::ErrorResponse),
            0x0111
        );
        assert_eq!(
            StunMessageType::decode(0x0111).unwrap(),
            (StunMessageType::Binding, StunMessageClass::ErrorResponse)
        );
    }

    #[test]
    fn test_binding_request_header() {
        let msg = StunMessage::binding_request();
        let encoded = msg.encode();

        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[0..2], &[0x00, 0x01]);
        assert_eq!(&encoded[2..4], &[0x00, 0x00]);
        assert_eq!(&encoded[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&encoded[8..20], &msg.transaction_id);
    }

    #[test]
    fn test_change_request_is_eight_bytes() {
        let msg = StunMessage::binding_request().with_attribute(StunAttribute::ChangeRequest {
            change_ip: true,
            change_port: true,
        });
        let encoded = msg.encode();

        assert_eq!(encoded.len(), HEADER_SIZE + 8);
        assert_eq!(&encoded[2..4], &[0x00, 0x08]);
        assert_eq!(&encoded[20..24], &[0x00, 0x03, 0x00, 0x04]);
        assert_eq!(&encoded[24..28], &[0, 0, 0, 0x06]);

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.change_request(), Some((true, true)));
    }

    #[test]
    fn test_decode_hand_crafted_ipv4_response() {
        // Binding Success Response, XOR-MAPPED-ADDRESS 192.0.2.1:32853
        let tid = [0x01; 12];
        let mut bytes = vec![0x01, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xA4, 0x42];
        bytes.extend_from_slice(&tid);
        bytes.extend_from_slice(&[0x00, 0x20, 0x00, 0x08]);
        bytes.extend_from_slice(&[0x00, 0x01, 0xA1, 0x47, 0xE1, 0x12, 0xA6, 0x43]);

        let msg = StunMessage::decode(&bytes).unwrap();
        assert_eq!(msg.message_class, StunMessageClass::SuccessResponse);
        assert_eq!(
            msg.mapped_address(),
            Some("192.0.2.1:32853".parse().unwrap())
        );
    }

    #[test]
    fn test_decode_hand_crafted_ipv6_response() {
        // RFC 5769 section 2.3 test vector
        let tid = [
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ];
        let mut bytes = vec![0x01, 0x01, 0x00, 0x18, 0x21, 0x12, 0xA4, 0x42];
        bytes.extend_from_slice(&tid);
        bytes.extend_from_slice(&[0x00, 0x20, 0x00, 0x14, 0x00, 0x02, 0xa1, 0x47]);
        bytes.extend_from_slice(&[
            0x01, 0x13, 0xa9, 0xfa, 0xa5, 0xd3, 0xf1, 0x79, 0xbc, 0x25, 0xf4, 0xb5, 0xbe, 0xd2,
            0xb9, 0xd9,
        ]);

        let msg = StunMessage::decode(&bytes).unwrap();
        assert_eq!(
            msg.mapped_address(),
            Some("[2001:db8:1234:5678:11:2233:4455:6677]:32853".parse().unwrap())
        );
    }

    #[test]
    fn test_xor_preferred_over_mapped() {
        let xor: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let plain: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let msg = StunMessage::binding_response([7; 12])
            .with_attribute(StunAttribute::MappedAddress(plain))
            .with_attribute(StunAttribute::XorMappedAddress(xor));

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.mapped_address(), Some(xor));

        let msg = StunMessage::binding_response([7; 12])
            .with_attribute(StunAttribute::MappedAddress(plain));
        assert_eq!(msg.mapped_address(), Some(plain));
    }

    #[test]
    fn test_legacy_attributes_fill_origin_and_other() {
        let origin: SocketAddr = "198.51.100.1:3478".parse().unwrap();
        let other: SocketAddr = "198.51.100.2:3479".parse().unwrap();
        let msg = StunMessage::binding_response([3; 12])
            .with_attribute(StunAttribute::XorMappedAddress("1.2.3.4:5".parse().unwrap()))
            .with_attribute(StunAttribute::SourceAddress(origin))
            .with_attribute(StunAttribute::ChangedAddress(other));

        let result = StunMessage::decode(&msg.encode())
            .unwrap()
            .into_probe_result(&[3; 12], origin)
            .unwrap();
        assert_eq!(result.response_origin, Some(origin));
        assert_eq!(result.other_address, Some(other));
    }

    #[test]
    fn test_unknown_attribute_skipped_with_padding() {
        let mapped: SocketAddr = "192.0.2.77:9".parse().unwrap();
        let msg = StunMessage::binding_response([9; 12])
            .with_attribute(StunAttribute::Unknown(0x8055, vec![1, 2, 3, 4, 5]))
            .with_attribute(StunAttribute::XorMappedAddress(mapped));
        let encoded = msg.encode();

        // 5-byte value padded to 8
        assert_eq!(encoded.len(), HEADER_SIZE + 4 + 8 + 4 + 8);

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.mapped_address(), Some(mapped));
        assert_eq!(
            decoded.attributes[0],
            StunAttribute::Unknown(0x8055, vec![1, 2, 3, 4, 5])
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            StunMessage::decode(&[0u8; 10]),
            Err(InvalidResponse::TooShort(10))
        );

        let mut bytes = StunMessage::binding_request().encode();
        bytes[4] = 0xFF;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(InvalidResponse::MagicCookie(_))
        ));

        // Attribute claims 8 bytes, only 4 present
        let mut bytes = StunMessage::binding_response([0; 12]).encode();
        bytes[3] = 8;
        bytes.extend_from_slice(&[0x00, 0x20, 0x00, 0x08, 0, 1, 0, 0]);
        assert_eq!(
            StunMessage::decode(&bytes),
            Err(InvalidResponse::TruncatedAttribute(0x0020))
        );

        // Unsupported family
        let mut bytes = StunMessage::binding_response([0; 12]).encode();
        bytes[3] = 12;
        bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x08, 0, 9, 0, 80, 1, 2, 3, 4]);
        assert_eq!(
            StunMessage::decode(&bytes),
            Err(InvalidResponse::UnsupportedFamily(9))
        );
    }

    #[test]
    fn test_probe_result_validation() {
        let mapped: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        let source: SocketAddr = "192.0.2.200:3478".parse().unwrap();

        let msg = StunMessage::binding_response([1; 12])
            .with_attribute(StunAttribute::XorMappedAddress(mapped));
        assert_eq!(
            msg.clone().into_probe_result(&[2; 12], source),
            Err(InvalidResponse::TransactionMismatch)
        );

        let mut error = msg.clone();
        error.message_class = StunMessageClass::ErrorResponse;
        assert_eq!(
            error.into_probe_result(&[1; 12], source),
            Err(InvalidResponse::ErrorResponse)
        );

        assert_eq!(
            StunMessage::binding_response([1; 12]).into_probe_result(&[1; 12], source),
            Err(InvalidResponse::MissingMappedAddress)
        );

        let result = msg.into_probe_result(&[1; 12], source).unwrap();
        assert_eq!(result.mapped, mapped);
        assert_eq!(result.source, source);
    }

    #[test]
    fn test_stun_error_display() {
        assert_eq!(StunError::Timeout.to_string(), "STUN query timeout");
        assert_eq!(
            StunError::Invalid(InvalidResponse::TransactionMismatch).to_string(),
            "invalid STUN response: transaction ID mismatch"
        );
        assert!(StunError::Timeout.is_no_response());
        assert!(!StunError::Cancelled.is_no_response());
    }

    #[tokio::test]
    async fn test_probe_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();

            // Stray garbage first, then the real answer
            server.send_to(b"not stun", from).await.unwrap();
            let response = StunMessage::binding_response(request.transaction_id)
                .with_attribute(StunAttribute::XorMappedAddress(from));
            server.send_to(&response.encode(), from).await.unwrap();
        });

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap(), quick_config())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let result = client.probe(server_addr, false, false, &cancel).await.unwrap();

        assert_eq!(result.mapped, client.local_addr().unwrap());
        assert_eq!(result.source, server_addr);
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();

        let err = StunClient::probe_once(
            silent.local_addr().unwrap(),
            false,
            false,
            quick_config(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StunError::Timeout));
    }

    #[tokio::test]
    async fn test_probe_cancelled() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = StunClient::probe_once(
            silent.local_addr().unwrap(),
            true,
            false,
            StunConfig::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StunError::Cancelled));
    }
}
