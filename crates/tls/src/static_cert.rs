//! Statically configured platform certificate
//!
//! Loaded once at startup from PEM files; never reloaded. An empty store is a
//! valid state (no platform certificate configured).

use crate::certificate::{parse_pem_pair, LeafInfo};
use crate::error::TlsError;
use chrono::Utc;
use rustls::sign::CertifiedKey;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Certificate chain, signing key and parsed leaf
#[derive(Debug, Clone)]
pub struct StaticCertificate {
    key: Arc<CertifiedKey>,
    leaf: LeafInfo,
}

impl StaticCertificate {
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.key
    }

    pub fn leaf(&self) -> &LeafInfo {
        &self.leaf
    }
}

/// Holds at most one platform certificate
#[derive(Debug, Clone, Default)]
pub struct StaticCertificateStore {
    cert: Option<StaticCertificate>,
}

impl StaticCertificateStore {
    /// A store with no certificate
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the key pair from files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let config_err = |reason: String| TlsError::Config {
            cert: cert_path.display().to_string(),
            key: key_path.display().to_string(),
            reason,
        };

        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| config_err(e.to_string()))?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| config_err(e.to_string()))?;

        let store = Self::from_pem(&cert_pem, &key_pem).map_err(|e| match e {
            TlsError::CertificateError(reason) => config_err(reason),
            other => other,
        })?;

        if let Some(cert) = &store.cert {
            info!(
                cert = ?cert_path,
                names = ?cert.leaf.dns_names,
                expires_at = %cert.leaf.not_after,
                "Loaded static certificate"
            );
        }
        Ok(store)
    }

    /// Load the key pair from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let parsed = parse_pem_pair(cert_pem, key_pem).map_err(TlsError::CertificateError)?;

        if parsed.leaf.is_expired(Utc::now()) {
            warn!(
                names = ?parsed.leaf.dns_names,
                expired_at = %parsed.leaf.not_after,
                "Static certificate has expired"
            );
        }

        Ok(Self {
            cert: Some(StaticCertificate {
                key: parsed.key,
                leaf: parsed.leaf,
            }),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.cert.is_some()
    }

    pub fn certificate(&self) -> Option<&StaticCertificate> {
        self.cert.as_ref()
    }

    /// Whether the loaded leaf covers `server_name` and has not expired
    pub fn matches(&self, server_name: &str) -> bool {
        self.usable(server_name).is_some()
    }

    /// The certificate to present for `server_name`, if the leaf covers it
    /// and is still valid. An expired leaf is never presented.
    pub fn get(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.usable(server_name).map(|c| c.key.clone())
    }

    fn usable(&self, server_name: &str) -> Option<&StaticCertificate> {
        self.cert
            .as_ref()
            .filter(|c| c.leaf.matches(server_name) && !c.leaf.is_expired(Utc::now()))
    }
}
