//! tls: per-handshake certificate selection for tenant-tls
//!
//! Platform subdomains are served from a static certificate; custom domains
//! get certificates issued on demand over ACME HTTP-01 and kept in a
//! persistent cache.

pub mod acme;
pub mod cache;
pub mod certificate;
pub mod challenge;
pub mod error;
pub mod hostname;
pub mod issuer;
pub mod listener;
pub mod manager;
pub mod renewal;
pub mod static_cert;

pub use acme::{
    get_acme_ca_name, resolve_acme_ca, validate_domain, AcmeAuthority, CertificateAuthority,
    IssuedCertificate,
};
pub use cache::{
    open_cache, CachedCertificate, CertCache, FileCertCache, MemoryCertCache, SqlCertCache,
};
pub use certificate::{hostname_matches, LeafInfo};
pub use challenge::{ChallengeServer, ChallengeTokens};
pub use error::{CacheError, IssuanceError, TlsError, ValidationError};
pub use hostname::{Classification, ValidatedName};
pub use issuer::{AllowAll, CertificateIssuer, HostPolicy};
pub use listener::{ConnectionHandler, ForwardHandler, HandshakeError, TlsListener};
pub use manager::{
    AutoIssueStrategy, CertificateManager, CertificateSource, RejectReason, Resolution,
    ResolveStrategy, StaticStrategy, StrategyOutcome,
};
pub use renewal::{shutdown_channel, RenewalScheduler, RenewalReport};
pub use static_cert::{StaticCertificate, StaticCertificateStore};
