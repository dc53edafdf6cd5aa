//! Traversal configuration
//!
//! Every component takes its own configuration struct. `TraversalConfig`
//! aggregates them for applications that wire the whole subsystem at once.

use std::time::Duration;
use thiserror::Error;

/// Minimum UDP punch packet size (4-byte magic + 16-byte nonce)
pub const MIN_PUNCH_PACKET_SIZE: usize = 20;

/// Default UDP punch packet size
pub const DEFAULT_PUNCH_PACKET_SIZE: usize = 64;

/// Configuration validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric field is out of its allowed range
    #[error("{field} out of range: {reason}")]
    OutOfRange {
        /// Offending field
        field: &'static str,
        /// What the allowed range is
        reason: &'static str,
    },

    /// A duration field must be non-zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// STUN probe configuration
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// Time to wait for a response to one transmission
    pub timeout: Duration,

    /// Retransmissions after the first attempt
    pub retries: u32,

    /// SOFTWARE attribute carried on requests
    pub software: Option<String>,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retries: 2,
            software: Some(concat!("natpunch/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

impl StunConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the timeout is zero or retries exceed 10.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("stun.timeout"));
        }
        if self.retries > 10 {
            return Err(ConfigError::OutOfRange {
                field: "stun.retries",
                reason: "at most 10 retransmissions",
            });
        }
        Ok(())
    }
}

/// NAT type detector configuration
#[derive(Debug, Clone)]
pub struct NatDetectorConfig {
    /// Per-probe STUN settings
    pub stun: StunConfig,

    /// How long a detection result stays valid
    pub cache_ttl: Duration,

    /// Interval of the background re-detection loop
    pub redetect_interval: Duration,

    /// Local address the probe socket binds to
    pub bind_addr: std::net::SocketAddr,
}

impl Default for NatDetectorConfig {
    fn default() -> Self {
        Self {
            stun: StunConfig::default(),
            cache_ttl: Duration::from_secs(600),
            redetect_interval: Duration::from_secs(300),
            bind_addr: std::net::SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl NatDetectorConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on a zero TTL/interval or invalid STUN settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stun.validate()?;
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("nat.cache_ttl"));
        }
        if self.redetect_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("nat.redetect_interval"));
        }
        Ok(())
    }
}

/// Reachability classifier configuration
#[derive(Debug, Clone)]
pub struct ReachabilityConfig {
    /// Consecutive same-direction signals needed to commit a state
    pub confidence_threshold: u32,

    /// Interval between dial-back probe rounds
    pub probe_interval: Duration,

    /// Peers asked for a dial-back per round
    pub peers_per_round: usize,

    /// Timeout of a single dial-back request
    pub dial_back_timeout: Duration,

    /// Start administratively locked to Public (bootstrap/relay nodes)
    pub lock_public: bool,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 3,
            probe_interval: Duration::from_secs(60),
            peers_per_round: 3,
            dial_back_timeout: Duration::from_secs(15),
            lock_public: false,
        }
    }
}

impl ReachabilityConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the threshold or peer count is zero, or an
    /// interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.confidence_threshold == 0 {
            return Err(ConfigError::OutOfRange {
                field: "reachability.confidence_threshold",
                reason: "must be at least 1",
            });
        }
        if self.peers_per_round == 0 {
            return Err(ConfigError::OutOfRange {
                field: "reachability.peers_per_round",
                reason: "must be at least 1",
            });
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("reachability.probe_interval"));
        }
        if self.dial_back_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("reachability.dial_back_timeout"));
        }
        Ok(())
    }
}

/// UDP puncher configuration
#[derive(Debug, Clone)]
pub struct UdpPunchConfig {
    /// Size of every punch packet, zero padded (minimum 20)
    pub packet_size: usize,

    /// Packets sent to one candidate before giving up on it
    pub max_attempts: u32,

    /// Wait for a reply after each packet
    pub attempt_interval: Duration,

    /// Overall limit for one punch
    pub timeout: Duration,

    /// Pin the local source port (SO_REUSEADDR/SO_REUSEPORT applied)
    pub local_port: Option<u16>,
}

impl Default for UdpPunchConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PUNCH_PACKET_SIZE,
            max_attempts: 20,
            attempt_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
            local_port: None,
        }
    }
}

impl UdpPunchConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the packet size is below the 20-byte minimum,
    /// attempts are zero, or a duration is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_size < MIN_PUNCH_PACKET_SIZE || self.packet_size > 1400 {
            return Err(ConfigError::OutOfRange {
                field: "udp.packet_size",
                reason: "must be between 20 and 1400 bytes",
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "udp.max_attempts",
                reason: "must be at least 1",
            });
        }
        if self.attempt_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("udp.attempt_interval"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("udp.timeout"));
        }
        Ok(())
    }
}

/// TCP puncher configuration
#[derive(Debug, Clone)]
pub struct TcpPunchConfig {
    /// Connect attempts per candidate
    pub max_attempts: u32,

    /// Timeout of a single connect attempt
    pub connect_timeout: Duration,

    /// Pause after a failed attempt
    pub attempt_interval: Duration,

    /// Apply SO_REUSEPORT in addition to SO_REUSEADDR
    pub enable_reuse_port: bool,

    /// Pin the local source port used by `punch`
    pub local_port: Option<u16>,
}

impl Default for TcpPunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            connect_timeout: Duration::from_secs(1),
            attempt_interval: Duration::from_millis(500),
            enable_reuse_port: true,
            local_port: None,
        }
    }
}

impl TcpPunchConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if attempts are zero or a duration is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "tcp.max_attempts",
                reason: "must be at least 1",
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("tcp.connect_timeout"));
        }
        if self.attempt_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("tcp.attempt_interval"));
        }
        Ok(())
    }
}

/// Punch coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Whole-negotiation retries after the first attempt
    pub max_hole_punch_retries: u32,

    /// Fixed pause between retries so NAT mappings have time to form
    pub retry_delay: Duration,

    /// Limit for one whole Connect and Sync exchange
    pub negotiation_timeout: Duration,

    /// Limit for the whole `direct_connect` operation
    pub session_timeout: Duration,

    /// Timeout for one `DirectDialer` attempt
    pub dial_timeout: Duration,

    /// Refuse to punch when the local NAT is known to be symmetric
    pub skip_on_symmetric_nat: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_hole_punch_retries: 3,
            retry_delay: Duration::from_secs(2),
            negotiation_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            skip_on_symmetric_nat: false,
        }
    }
}

impl CoordinatorConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any timeout is zero or retries exceed 10.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_hole_punch_retries > 10 {
            return Err(ConfigError::OutOfRange {
                field: "punch.max_hole_punch_retries",
                reason: "at most 10 retries",
            });
        }
        if self.negotiation_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("punch.negotiation_timeout"));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("punch.session_timeout"));
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("punch.dial_timeout"));
        }
        Ok(())
    }
}

/// Configuration of the whole traversal subsystem
#[derive(Debug, Clone, Default)]
pub struct TraversalConfig {
    /// NAT type detection
    pub nat: NatDetectorConfig,

    /// Reachability classification
    pub reachability: ReachabilityConfig,

    /// UDP punching
    pub udp: UdpPunchConfig,

    /// TCP punching
    pub tcp: TcpPunchConfig,

    /// Negotiation and retry policy
    pub coordinator: CoordinatorConfig,
}

impl TraversalConfig {
    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first section error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nat.validate()?;
        self.reachability.validate()?;
        self.udp.validate()?;
        self.tcp.validate()?;
        self.coordinator.validate()
    }
}
