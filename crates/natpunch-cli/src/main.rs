//! natpunch CLI
//!
//! NAT diagnostics and manual hole punching tests

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use natpunch_core::nat::{NatDetector, StunClient};
use natpunch_core::punch::NONCE_LEN;
use natpunch_core::{PeerId, TcpPuncher, UdpPuncher};
use tokio_util::sync::CancellationToken;

use config::Config;

/// natpunch - NAT type detection and hole punching diagnostics
#[derive(Parser)]
#[command(name = "natpunch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one STUN Binding Request and print the result
    Stun {
        /// STUN server (host:port), defaults to the configured server
        server: Option<String>,

        /// Ask the server to answer from its other IP
        #[arg(long)]
        change_ip: bool,

        /// Ask the server to answer from its other port
        #[arg(long)]
        change_port: bool,
    },

    /// Classify the local NAT
    NatType {
        /// Primary STUN server (host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// Second STUN server for the mapping test (host:port)
        #[arg(short, long)]
        alternate: Option<String>,
    },

    /// Punch a UDP hole toward a peer running the same command
    UdpPunch {
        /// Peer address (ip:port)
        #[arg(short, long)]
        peer: SocketAddr,

        /// Shared 16-byte session nonce as hex
        #[arg(short, long)]
        nonce: String,

        /// Local port to punch from
        #[arg(short, long)]
        local_port: Option<u16>,
    },

    /// Attempt a TCP simultaneous open toward a peer
    TcpPunch {
        /// Peer address (ip:port)
        #[arg(short, long)]
        peer: SocketAddr,

        /// Local port to connect from
        #[arg(short, long)]
        local_port: Option<u16>,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    config.validate()?;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    match cli.command {
        Commands::Stun {
            server,
            change_ip,
            change_port,
        } => {
            let server = server.unwrap_or_else(|| config.stun.server.clone());
            stun_probe(&server, change_ip, change_port, &config, &cancel).await?;
        }
        Commands::NatType { server, alternate } => {
            let server = server.unwrap_or_else(|| config.stun.server.clone());
            let alternate = alternate.or_else(|| config.stun.alternate.clone());
            nat_type(&server, alternate.as_deref(), &config, &cancel).await?;
        }
        Commands::UdpPunch {
            peer,
            nonce,
            local_port,
        } => {
            udp_punch(peer, &nonce, local_port, &config, &cancel).await?;
        }
        Commands::TcpPunch { peer, local_port } => {
            tcp_punch(peer, local_port, &config, &cancel).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => init_config(&config_path, force)?,
            ConfigAction::Show => print!("{}", toml::to_string_pretty(&config)?),
        },
    }

    Ok(())
}

/// Resolve host:port to the first socket address
async fn resolve(server: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("resolving {server}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("{server} did not resolve to any address"))
}

/// Send one Binding Request
async fn stun_probe(
    server: &str,
    change_ip: bool,
    change_port: bool,
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let server = resolve(server).await?;
    let result = StunClient::probe_once(
        server,
        change_ip,
        change_port,
        config.traversal().nat.stun,
        cancel,
    )
    .await?;

    println!("Server:          {server}");
    println!("Answered from:   {}", result.source);
    println!("Mapped address:  {}", result.mapped);
    if let Some(origin) = result.response_origin {
        println!("Response origin: {origin}");
    }
    if let Some(other) = result.other_address {
        println!("Other address:   {other}");
    }
    Ok(())
}

/// Run the NAT classifier
async fn nat_type(
    server: &str,
    alternate: Option<&str>,
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let primary = resolve(server).await?;
    let mut detector = NatDetector::new(primary, config.traversal().nat)
        .with_span(tracing::info_span!("nat", server = %primary));
    if let Some(alternate) = alternate {
        detector = detector.with_alternate(resolve(alternate).await?);
    }

    println!("Probing {primary}...");
    let nat = detector.detect(cancel).await?;
    println!("NAT type: {nat}");
    if !nat.punch_friendly() {
        println!("Hole punching is unlikely to work; use a relay");
    }
    Ok(())
}

/// Punch toward a peer running `udp-punch` with the same nonce
async fn udp_punch(
    peer: SocketAddr,
    nonce: &str,
    local_port: Option<u16>,
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let nonce: [u8; NONCE_LEN] = hex::decode(nonce)
        .context("nonce is not valid hex")?
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("nonce must be {NONCE_LEN} bytes, got {}", v.len()))?;

    let mut udp = config.traversal().udp;
    udp.local_port = local_port;
    let puncher = UdpPuncher::new(udp).with_span(tracing::info_span!("udp"));

    println!("Punching UDP toward {peer}...");
    let punch = puncher
        .punch(&PeerId::new(peer.to_string()), &nonce, &[peer], cancel)
        .await?;
    println!(
        "Hole punched: {} <-> {}",
        punch.socket.local_addr()?,
        punch.remote
    );
    Ok(())
}

/// Simultaneous open toward a peer running `tcp-punch`
async fn tcp_punch(
    peer: SocketAddr,
    local_port: Option<u16>,
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let puncher = TcpPuncher::new(config.traversal().tcp).with_span(tracing::info_span!("tcp"));

    println!("Connecting TCP toward {peer}...");
    let (stream, remote) = puncher
        .punch_with_local_port(&PeerId::new(peer.to_string()), local_port, &[peer], cancel)
        .await?;
    println!("Connected: {} <-> {remote}", stream.local_addr()?);
    Ok(())
}

/// Write a default configuration file
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
