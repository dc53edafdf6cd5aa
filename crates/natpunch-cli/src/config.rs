//! Configuration file for the natpunch CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use natpunch_core::TraversalConfig;

/// natpunch configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// STUN servers and probe settings
    #[serde(default)]
    pub stun: StunSection,
    /// NAT detector settings
    #[serde(default)]
    pub nat: NatSection,
    /// UDP puncher settings
    #[serde(default)]
    pub udp: UdpSection,
    /// TCP puncher settings
    #[serde(default)]
    pub tcp: TcpSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// STUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunSection {
    /// Primary server (host:port)
    #[serde(default = "default_stun_server")]
    pub server: String,
    /// Second server for the mapping test (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate: Option<String>,
    /// Per-transmission timeout in milliseconds
    #[serde(default = "default_stun_timeout_ms")]
    pub timeout_ms: u64,
    /// Retransmissions per probe
    #[serde(default = "default_stun_retries")]
    pub retries: u32,
}

/// NAT detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatSection {
    /// Result cache lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

/// UDP puncher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpSection {
    /// Punch packet size in bytes
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    /// Sends per candidate
    #[serde(default = "default_udp_attempts")]
    pub max_attempts: u32,
    /// Wait between sends in milliseconds
    #[serde(default = "default_udp_interval_ms")]
    pub attempt_interval_ms: u64,
    /// Overall timeout in milliseconds
    #[serde(default = "default_udp_timeout_ms")]
    pub timeout_ms: u64,
}

/// TCP puncher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSection {
    /// Connect attempts per candidate
    #[serde(default = "default_tcp_attempts")]
    pub max_attempts: u32,
    /// Per-connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Wait between attempts in milliseconds
    #[serde(default = "default_tcp_interval_ms")]
    pub attempt_interval_ms: u64,
    /// Set SO_REUSEADDR/SO_REUSEPORT before connecting
    #[serde(default = "default_true")]
    pub enable_reuse_port: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_stun_server() -> String {
    "stun.l.google.com:19302".to_string()
}

fn default_stun_timeout_ms() -> u64 {
    3_000
}

fn default_stun_retries() -> u32 {
    2
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_packet_size() -> usize {
    natpunch_core::config::DEFAULT_PUNCH_PACKET_SIZE
}

fn default_udp_attempts() -> u32 {
    20
}

fn default_udp_interval_ms() -> u64 {
    200
}

fn default_udp_timeout_ms() -> u64 {
    10_000
}

fn default_tcp_attempts() -> u32 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_tcp_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StunSection {
    fn default() -> Self {
        Self {
            server: default_stun_server(),
            alternate: None,
            timeout_ms: default_stun_timeout_ms(),
            retries: default_stun_retries(),
        }
    }
}

impl Default for NatSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for UdpSection {
    fn default() -> Self {
        Self {
            packet_size: default_packet_size(),
            max_attempts: default_udp_attempts(),
            attempt_interval_ms: default_udp_interval_ms(),
            timeout_ms: default_udp_timeout_ms(),
        }
    }
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            max_attempts: default_tcp_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            attempt_interval_ms: default_tcp_interval_ms(),
            enable_reuse_port: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("natpunch/config.toml")
    }

    /// Load config from `path` if it exists, defaults otherwise
    ///
    /// Unlike the node daemon config, nothing is written: `config init`
    /// creates the file explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Library configuration built from this file
    #[must_use]
    pub fn traversal(&self) -> TraversalConfig {
        let mut config = TraversalConfig::default();

        config.nat.stun.timeout = Duration::from_millis(self.stun.timeout_ms);
        config.nat.stun.retries = self.stun.retries;
        config.nat.cache_ttl = Duration::from_secs(self.nat.cache_ttl_secs);

        config.udp.packet_size = self.udp.packet_size;
        config.udp.max_attempts = self.udp.max_attempts;
        config.udp.attempt_interval = Duration::from_millis(self.udp.attempt_interval_ms);
        config.udp.timeout = Duration::from_millis(self.udp.timeout_ms);

        config.tcp.max_attempts = self.tcp.max_attempts;
        config.tcp.connect_timeout = Duration::from_millis(self.tcp.connect_timeout_ms);
        config.tcp.attempt_interval = Duration::from_millis(self.tcp.attempt_interval_ms);
        config.tcp.enable_reuse_port = self.tcp.enable_reuse_port;

        config
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_host_port(&self.stun.server, "STUN server")?;
        if let Some(alternate) = &self.stun.alternate {
            validate_host_port(alternate, "Alternate STUN server")?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.traversal().validate()?;
        Ok(())
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!("{name} '{addr}' missing port (expected format: host:port)");
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' has invalid port: {port_str}"))?;
    if port == 0 {
        anyhow::bail!("{name} '{addr}' has invalid port: 0");
    }

    if host.is_empty() {
        anyhow::bail!("{name} '{addr}' has empty hostname");
    }
    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{name} '{addr}' contains invalid characters");
    }

    Ok(())
}
