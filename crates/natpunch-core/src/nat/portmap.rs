//! Port mapping registry
//!
//! UPnP-IGD and NAT-PMP clients are external collaborators implementing
//! [`PortMapper`]. The registry tries available mappers in registration
//! order, remembers what it mapped and removes everything on shutdown.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{Span, debug, info, warn};

use crate::BoxError;

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// UDP
    Udp,
    /// TCP
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

/// Port mapping error
#[derive(Debug, Error)]
pub enum PortMapError {
    /// No registered mapper reports itself available
    #[error("no port mapper available")]
    NoMapperAvailable,

    /// Every available mapper failed
    #[error("port mapping failed via {name}: {source}")]
    MapperFailed {
        /// Mapper that failed last
        name: String,
        /// Its error
        #[source]
        source: BoxError,
    },
}

/// Router port mapping capability (UPnP-IGD, NAT-PMP, ...)
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Whether a gateway speaking this protocol was found
    fn available(&self) -> bool;

    /// Gateway's external IP
    async fn external_address(&self) -> Result<IpAddr, BoxError>;

    /// Map `internal_port`; returns the external port granted
    async fn add_mapping(
        &self,
        protocol: Protocol,
        internal_port: u16,
        description: &str,
        duration: Duration,
    ) -> Result<u16, BoxError>;

    /// Remove a mapping by external port
    async fn delete_mapping(&self, protocol: Protocol, external_port: u16) -> Result<(), BoxError>;
}

/// A mapping created through the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMapping {
    /// Mapper that created it
    pub mapper: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Local port
    pub internal_port: u16,
    /// Port opened on the gateway
    pub external_port: u16,
    /// Requested lifetime
    pub duration: Duration,
    /// When it was created
    pub created_at: Instant,
}

/// Ordered set of port mappers
pub struct PortMappingRegistry {
    mappers: Vec<Arc<dyn PortMapper>>,
    active: Mutex<Vec<ActiveMapping>>,
    span: Span,
}

impl Default for PortMappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortMappingRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            mappers: Vec::new(),
            active: Mutex::new(Vec::new()),
            span: Span::none(),
        }
    }

    /// Attach log output to `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Register a mapper; earlier registrations are preferred
    pub fn register(&mut self, mapper: Arc<dyn PortMapper>) {
        self.mappers.push(mapper);
    }

    /// Mappings currently held
    #[must_use]
    pub fn active_mappings(&self) -> Vec<ActiveMapping> {
        self.active.lock().clone()
    }

    /// External IP from the first available mapper that answers
    ///
    /// # Errors
    ///
    /// Returns `PortMapError` if no mapper is available or all fail.
    pub async fn external_address(&self) -> Result<IpAddr, PortMapError> {
        let mut last = None;
        for mapper in self.mappers.iter().filter(|m| m.available()) {
            match mapper.external_address().await {
                Ok(ip) => return Ok(ip),
                Err(e) => {
                    debug!(
                        parent: &self.span,
                        mapper = mapper.name(),
                        error = %e,
                        "external address failed"
                    );
                    last = Some((mapper.name().to_string(), e));
                }
            }
        }
        Err(Self::exhausted(last))
    }

    /// Map `internal_port` through the first mapper that succeeds
    ///
    /// # Errors
    ///
    /// Returns `PortMapError` if no mapper is available or all fail.
    pub async fn add_mapping(
        &self,
        protocol: Protocol,
        internal_port: u16,
        description: &str,
        duration: Duration,
    ) -> Result<ActiveMapping, PortMapError> {
        let mut last = None;
        for mapper in self.mappers.iter().filter(|m| m.available()) {
            match mapper
                .add_mapping(protocol, internal_port, description, duration)
                .await
            {
                Ok(external_port) => {
                    let mapping = ActiveMapping {
                        mapper: mapper.name().to_string(),
                        protocol,
                        internal_port,
                        external_port,
                        duration,
                        created_at: Instant::now(),
                    };
                    info!(
                        parent: &self.span,
                        mapper = mapper.name(),
                        %protocol,
                        internal_port,
                        external_port,
                        "port mapping added"
                    );
                    self.active.lock().push(mapping.clone());
                    return Ok(mapping);
                }
                Err(e) => {
                    debug!(
                        parent: &self.span,
                        mapper = mapper.name(),
                        error = %e,
                        "add mapping failed"
                    );
                    last = Some((mapper.name().to_string(), e));
                }
            }
        }
        Err(Self::exhausted(last))
    }

    /// Remove every mapping created through this registry
    ///
    /// Failures are logged; the mapping is forgotten either way since it
    /// expires on the gateway.
    pub async fn remove_all(&self) {
        let mappings = std::mem::take(&mut *self.active.lock());
        for mapping in mappings {
            let Some(mapper) = self.mappers.iter().find(|m| m.name() == mapping.mapper) else {
                continue;
            };
            if let Err(e) = mapper
                .delete_mapping(mapping.protocol, mapping.external_port)
                .await
            {
                warn!(
                    parent: &self.span,
                    mapper = %mapping.mapper,
                    external_port = mapping.external_port,
                    error = %e,
                    "failed to delete port mapping"
                );
            }
        }
    }

    fn exhausted(last: Option<(String, BoxError)>) -> PortMapError {
        match last {
            Some((name, source)) => PortMapError::MapperFailed { name, source },
            None => PortMapError::NoMapperAvailable,
        }
    }
}
