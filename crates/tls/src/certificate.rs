//! PEM parsing, leaf inspection and X.509 host matching

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, private_key};
use std::io::BufReader;
use std::sync::Arc;
use x509_parser::prelude::*;

/// Names and validity window of an end-entity certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    /// DNS subject alternative names, lowercased
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl LeafInfo {
    /// Parse a DER leaf certificate
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| format!("Failed to parse X509: {:?}", e))?;

        let mut dns_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push(dns.trim_end_matches('.').to_ascii_lowercase());
                }
            }
        }

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| "notBefore out of range".to_string())?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| "notAfter out of range".to_string())?;

        Ok(Self {
            dns_names,
            not_before,
            not_after,
        })
    }

    /// Whether any SAN of this leaf covers `host`
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.dns_names
            .iter()
            .any(|pattern| hostname_matches(pattern, &host))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

/// RFC 6125 matching of a lowercased SAN pattern against a lowercased host.
///
/// A wildcard is only honoured as the whole left-most label and covers
/// exactly one label: `*.example.com` matches `a.example.com` but neither
/// `example.com` nor `a.b.example.com`.
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    if host.is_empty() || pattern.is_empty() {
        return false;
    }

    match pattern.strip_prefix("*.") {
        Some(base) => {
            // Wildcards must sit above at least a two-label base
            if !base.contains('.') || base.contains('*') {
                return false;
            }
            match host.split_once('.') {
                Some((label, rest)) => !label.is_empty() && rest == base,
                None => false,
            }
        }
        None => !pattern.contains('*') && pattern == host,
    }
}

/// A parsed chain and signing key ready to hand to rustls, plus its leaf
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub key: Arc<CertifiedKey>,
    pub leaf: LeafInfo,
}

/// Parse a PEM chain and PEM private key. The first certificate in the
/// chain is the leaf.
pub fn parse_pem_pair(cert_pem: &str, key_pem: &str) -> Result<ParsedCertificate, String> {
    let chain = certs(&mut BufReader::new(cert_pem.as_bytes()))
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| e.to_string())?;

    let first = chain
        .first()
        .ok_or_else(|| "No certificate found in chain".to_string())?;
    let leaf = LeafInfo::from_der(first.as_ref())?;

    let key = private_key(&mut BufReader::new(key_pem.as_bytes()))
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "No private key found".to_string())?;

    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| e.to_string())?;

    let key = CertifiedKey::new(chain, signing_key);
    key.keys_match().map_err(|e| format!("Private key does not match certificate: {}", e))?;

    Ok(ParsedCertificate {
        key: Arc::new(key),
        leaf,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};
    use rcgen::{CertificateParams, KeyPair};

    /// Self-signed (cert_pem, key_pem) for the given SANs
    pub fn self_signed(names: &[&str]) -> (String, String) {
        let key_pair = KeyPair::generate().unwrap();
        let params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    /// Self-signed pair with an explicit notAfter, valid since 2020
    pub fn self_signed_until(names: &[&str], not_after: DateTime<Utc>) -> (String, String) {
        let since = DateTime::from_timestamp(1_577_836_800, 0).unwrap();
        self_signed_between(names, since, not_after)
    }

    /// Self-signed pair with an explicit validity window
    pub fn self_signed_between(
        names: &[&str],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> (String, String) {
        let key_pair = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.not_before =
            ::time::OffsetDateTime::from_unix_timestamp(not_before.timestamp()).unwrap();
        params.not_after =
            ::time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }
}
