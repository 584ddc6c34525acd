use crate::classifier::address_domain;
use crate::config::DnsCheckConfig;
use async_trait::async_trait;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub preference: u16,
    pub exchange: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("no MX records for {0}")]
    NoRecords(String),

    #[error("MX lookup for {domain} failed: {message}")]
    Lookup { domain: String, message: String },

    #[error("failed to create DNS resolver: {0}")]
    Resolver(String),
}

/// MX lookups, behind a trait so tests can stub them.
#[async_trait]
pub trait MxResolver: Send + Sync {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError>;
}

pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| DnsError::Resolver(e.to_string()))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl MxResolver for SystemResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError> {
        match self.inner.mx_lookup(domain).await {
            Ok(response) => Ok(response
                .iter()
                .map(|mx| MxHost {
                    preference: mx.preference(),
                    exchange: mx.exchange().to_utf8(),
                })
                .collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    Err(DnsError::NoRecords(domain.to_string()))
                }
                _ => Err(DnsError::Lookup {
                    domain: domain.to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// Outcome of the reachability check for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsVerdict {
    /// Check switched off; the address is accepted.
    Disabled,
    /// An MX host accepted a connection.
    Reachable { exchange: String },
    /// The domain has no MX records (or no domain at all). Permanent.
    DomainNotFound,
    /// MX hosts exist but none accepted a connection. Transient.
    Unreachable,
    /// The lookup itself failed or timed out. Transient.
    LookupFailed(String),
}

impl DnsVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DnsVerdict::Disabled | DnsVerdict::Reachable { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, DnsVerdict::DomainNotFound)
    }
}

#[derive(Clone)]
pub struct DnsCheck {
    resolver: Option<Arc<dyn MxResolver>>,
    port: u16,
    lookup_timeout: Duration,
    connect_timeout: Duration,
}

impl DnsCheck {
    pub fn new(resolver: Arc<dyn MxResolver>, config: &DnsCheckConfig) -> Self {
        Self {
            resolver: Some(resolver),
            port: config.port,
            lookup_timeout: Duration::from_secs(config.lookup_timeout_seconds),
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
        }
    }

    pub fn disabled() -> Self {
        let defaults = DnsCheckConfig::default();
        Self {
            resolver: None,
            port: defaults.port,
            lookup_timeout: Duration::from_secs(defaults.lookup_timeout_seconds),
            connect_timeout: Duration::from_secs(defaults.connect_timeout_seconds),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.resolver.is_some()
    }

    pub async fn check(&self, address: &str) -> DnsVerdict {
        let Some(resolver) = &self.resolver else {
            return DnsVerdict::Disabled;
        };

        let Some(domain) = address_domain(address) else {
            log::debug!("No domain in address {address}");
            return DnsVerdict::DomainNotFound;
        };

        log::debug!("Checking MX records for {domain}");
        let lookup = tokio::time::timeout(self.lookup_timeout, resolver.lookup_mx(domain));
        let mut hosts = match lookup.await {
            Ok(Ok(hosts)) => hosts,
            Ok(Err(DnsError::NoRecords(_))) => {
                log::debug!("No MX records found for {domain}");
                return DnsVerdict::DomainNotFound;
            }
            Ok(Err(e)) => {
                log::warn!("MX lookup failed for {domain}: {e}");
                return DnsVerdict::LookupFailed(e.to_string());
            }
            Err(_) => {
                log::warn!("MX lookup timed out for {domain}");
                return DnsVerdict::LookupFailed(format!("MX lookup for {domain} timed out"));
            }
        };

        if hosts.is_empty() {
            log::debug!("No MX records found for {domain}");
            return DnsVerdict::DomainNotFound;
        }

        hosts.sort_by_key(|mx| mx.preference);

        for mx in &hosts {
            let exchange = mx.exchange.trim_end_matches('.');
            if exchange.is_empty() {
                // null MX
                continue;
            }

            let connect = TcpStream::connect((exchange, self.port));
            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(_stream)) => {
                    log::debug!(
                        "MX host {exchange} (priority {}) reachable for {domain}",
                        mx.preference
                    );
                    return DnsVerdict::Reachable {
                        exchange: exchange.to_string(),
                    };
                }
                Ok(Err(e)) => log::debug!("MX host {exchange} for {domain} refused: {e}"),
                Err(_) => log::debug!("MX host {exchange} for {domain} timed out"),
            }
        }

        log::info!("No MX host of {domain} accepted a connection");
        DnsVerdict::Unreachable
    }
}
