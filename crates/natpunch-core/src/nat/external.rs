//! External IP discovery
//!
//! Discoverers are tried in ascending priority order; the first success wins
//! and is cached for a TTL. HTTP lookup services and similar live outside
//! this crate and plug in through [`IpDiscoverer`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug};

use super::stun::{StunClient, StunError};
use crate::BoxError;
use crate::config::StunConfig;

/// External address discovery error
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No discoverer is registered
    #[error("no IP discoverers registered")]
    NoDiscoverers,

    /// Every discoverer failed; carries the last failure
    #[error("all IP discoverers failed, last ({name}): {source}")]
    AllFailed {
        /// Name of the last discoverer tried
        name: String,
        /// Its error
        #[source]
        source: BoxError,
    },

    /// Caller cancelled discovery
    #[error("IP discovery cancelled")]
    Cancelled,
}

/// Strategy for learning this node's public IP
#[async_trait]
pub trait IpDiscoverer: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Lower values are tried first
    fn priority(&self) -> i32;

    /// Discover the public IP
    async fn discover(&self, cancel: &CancellationToken) -> Result<IpAddr, BoxError>;
}

/// Discoverer backed by one STUN Binding probe
pub struct StunIpDiscoverer {
    server: SocketAddr,
    config: StunConfig,
    priority: i32,
}

impl StunIpDiscoverer {
    /// Create a discoverer probing `server`
    #[must_use]
    pub fn new(server: SocketAddr, config: StunConfig) -> Self {
        Self {
            server,
            config,
            priority: 0,
        }
    }

    /// Override the default priority of 0
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl IpDiscoverer for StunIpDiscoverer {
    fn name(&self) -> &str {
        "stun"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn discover(&self, cancel: &CancellationToken) -> Result<IpAddr, BoxError> {
        let result =
            StunClient::probe_once(self.server, false, false, self.config.clone(), cancel).await?;
        Ok(result.mapped.ip())
    }
}

/// Priority-ordered registry of discoverers with a result cache
pub struct ExternalAddressResolver {
    discoverers: Vec<Arc<dyn IpDiscoverer>>,
    ttl: Duration,
    cache: RwLock<Option<(IpAddr, Instant)>>,
    span: Span,
}

impl ExternalAddressResolver {
    /// Create an empty resolver caching results for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            discoverers: Vec::new(),
            ttl,
            cache: RwLock::new(None),
            span: Span::none(),
        }
    }

    /// Attach log output to `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Register a discoverer, keeping the list sorted by priority
    ///
    /// Equal priorities keep registration order.
    pub fn register(&mut self, discoverer: Arc<dyn IpDiscoverer>) {
        self.discoverers.push(discoverer);
        self.discoverers.sort_by_key(|d| d.priority());
    }

    /// Names of registered discoverers in the order they are tried
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.discoverers.iter().map(|d| d.name().to_string()).collect()
    }

    /// Cached address, if still fresh
    #[must_use]
    pub fn cached(&self) -> Option<IpAddr> {
        let cached = *self.cache.read();
        cached
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(ip, _)| ip)
    }

    /// Drop the cached address
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    /// Resolve the external IP, falling through discoverers on error
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::NoDiscoverers` when empty,
    /// `DiscoveryError::Cancelled` when `cancel` fires and
    /// `DiscoveryError::AllFailed` when no discoverer succeeded.
    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<IpAddr, DiscoveryError> {
        if let Some(ip) = self.cached() {
            return Ok(ip);
        }

        let mut last = None;
        for discoverer in &self.discoverers {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }
            match discoverer.discover(cancel).await {
                Ok(ip) => {
                    debug!(
                        parent: &self.span,
                        discoverer = discoverer.name(),
                        %ip,
                        "external IP discovered"
                    );
                    *self.cache.write() = Some((ip, Instant::now()));
                    return Ok(ip);
                }
                Err(e) => {
                    if is_cancellation(&*e) {
                        return Err(DiscoveryError::Cancelled);
                    }
                    debug!(
                        parent: &self.span,
                        discoverer = discoverer.name(),
                        error = %e,
                        "discoverer failed"
                    );
                    last = Some((discoverer.name().to_string(), e));
                }
            }
        }

        match last {
            Some((name, source)) => Err(DiscoveryError::AllFailed { name, source }),
            None => Err(DiscoveryError::NoDiscoverers),
        }
    }
}

fn is_cancellation(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    matches!(err.downcast_ref::<StunError>(), Some(StunError::Cancelled))
}
