//! Per-handshake certificate resolution
//!
//! Validates the requested server name, then runs an ordered list of
//! strategies (static platform certificate first, automatic issuance second).
//! The first strategy to find a certificate or reject the name decides the
//! outcome. Every per-handshake error ends up as [`Resolution::Rejected`].

use crate::error::{IssuanceError, ValidationError};
use crate::hostname::{self, ValidatedName};
use crate::issuer::CertificateIssuer;
use crate::static_cert::StaticCertificateStore;
use async_trait::async_trait;
use config::DomainConfig;
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default deadline for resolving a certificate during a handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a resolved certificate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSource {
    Static,
    Cache,
    Issued,
}

impl fmt::Display for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateSource::Static => write!(f, "static"),
            CertificateSource::Cache => write!(f, "cache"),
            CertificateSource::Issued => write!(f, "issued"),
        }
    }
}

/// Why a handshake gets no certificate. Logged only; the client sees a
/// generic alert.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("{0}")]
    Invalid(#[from] ValidationError),

    #[error("no certificate source covers {0}")]
    NoCertificate(String),

    #[error("{0}")]
    Issuance(#[from] IssuanceError),

    #[error("certificate resolution exceeded {0:?}")]
    Timeout(Duration),
}

/// Outcome of [`CertificateManager::resolve`]
#[derive(Clone)]
pub enum Resolution {
    Resolved {
        certificate: Arc<CertifiedKey>,
        source: CertificateSource,
    },
    Rejected(RejectReason),
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }

    pub fn certificate(&self) -> Option<&Arc<CertifiedKey>> {
        match self {
            Resolution::Resolved { certificate, .. } => Some(certificate),
            Resolution::Rejected(_) => None,
        }
    }

    pub fn source(&self) -> Option<CertificateSource> {
        match self {
            Resolution::Resolved { source, .. } => Some(*source),
            Resolution::Rejected(_) => None,
        }
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Resolution::Resolved { .. } => None,
            Resolution::Rejected(reason) => Some(reason),
        }
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Resolved { source, .. } => {
                f.debug_struct("Resolved").field("source", source).finish()
            }
            Resolution::Rejected(reason) => f.debug_tuple("Rejected").field(reason).finish(),
        }
    }
}

/// What a single strategy concluded
pub enum StrategyOutcome {
    Found(Arc<CertifiedKey>, CertificateSource),
    /// Not this strategy's name; try the next one
    Pass,
    Reject(RejectReason),
}

/// One step of the resolution pipeline
#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, name: &ValidatedName) -> StrategyOutcome;
}

/// Serves the platform certificate when its leaf covers the name
pub struct StaticStrategy {
    store: Arc<StaticCertificateStore>,
}

impl StaticStrategy {
    pub fn new(store: Arc<StaticCertificateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResolveStrategy for StaticStrategy {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn resolve(&self, name: &ValidatedName) -> StrategyOutcome {
        match self.store.get(name.as_str()) {
            Some(key) => StrategyOutcome::Found(key, CertificateSource::Static),
            None => StrategyOutcome::Pass,
        }
    }
}

/// Cached or freshly issued certificate, bounded by the handshake deadline
pub struct AutoIssueStrategy {
    issuer: Arc<CertificateIssuer>,
    timeout: Duration,
}

impl AutoIssueStrategy {
    pub fn new(issuer: Arc<CertificateIssuer>, timeout: Duration) -> Self {
        Self { issuer, timeout }
    }
}

#[async_trait]
impl ResolveStrategy for AutoIssueStrategy {
    fn name(&self) -> &'static str {
        "auto-issue"
    }

    async fn resolve(&self, name: &ValidatedName) -> StrategyOutcome {
        match tokio::time::timeout(self.timeout, self.issuer.get_certificate(name.as_str())).await {
            Ok(Ok((key, source))) => StrategyOutcome::Found(key, source),
            Ok(Err(e)) => StrategyOutcome::Reject(RejectReason::Issuance(e)),
            Err(_) => {
                info!(
                    domain = %name.as_str(),
                    timeout_secs = self.timeout.as_secs(),
                    "Certificate not ready before handshake deadline, issuance continues"
                );
                StrategyOutcome::Reject(RejectReason::Timeout(self.timeout))
            }
        }
    }
}

/// Chooses the certificate for each handshake
pub struct CertificateManager {
    domain: DomainConfig,
    static_store: Arc<StaticCertificateStore>,
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl CertificateManager {
    /// A manager that only serves the static certificate
    pub fn new(domain: DomainConfig, static_store: StaticCertificateStore) -> Self {
        let static_store = Arc::new(static_store);
        Self {
            domain,
            strategies: vec![Box::new(StaticStrategy::new(static_store.clone()))],
            static_store,
        }
    }

    /// Append automatic issuance after the static strategy
    pub fn with_issuer(self, issuer: Arc<CertificateIssuer>, handshake_timeout: Duration) -> Self {
        self.with_strategy(Box::new(AutoIssueStrategy::new(issuer, handshake_timeout)))
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ResolveStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn domain_config(&self) -> &DomainConfig {
        &self.domain
    }

    pub fn static_store(&self) -> &StaticCertificateStore {
        &self.static_store
    }

    /// Certificate to present for `server_name`
    pub async fn resolve(&self, server_name: &str) -> Resolution {
        let name = match hostname::validate(
            server_name,
            &self.domain,
            self.static_store.is_configured(),
        ) {
            Ok(name) => name,
            Err(e) => {
                debug!(server_name = %server_name, reason = %e, "Rejected server name");
                return Resolution::Rejected(e.into());
            }
        };

        for strategy in &self.strategies {
            match strategy.resolve(&name).await {
                StrategyOutcome::Found(certificate, source) => {
                    debug!(
                        server_name = %name.as_str(),
                        strategy = strategy.name(),
                        source = %source,
                        "Resolved certificate"
                    );
                    return Resolution::Resolved {
                        certificate,
                        source,
                    };
                }
                StrategyOutcome::Pass => continue,
                StrategyOutcome::Reject(reason) => {
                    warn!(
                        server_name = %name.as_str(),
                        strategy = strategy.name(),
                        reason = %reason,
                        "Handshake rejected"
                    );
                    return Resolution::Rejected(reason);
                }
            }
        }

        debug!(server_name = %name.as_str(), "No certificate source matched");
        Resolution::Rejected(RejectReason::NoCertificate(name.as_str().to_string()))
    }
}
