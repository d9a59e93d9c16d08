//! TLS error types

use std::time::Duration;
use thiserror::Error;

/// Startup-time errors: certificate material, storage initialization,
/// listener binding. These halt initialization.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Failed to load key pair {cert} / {key}: {reason}")]
    Config {
        cert: String,
        key: String,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] CacheError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Server name rejected before any store is consulted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("empty server name")]
    Empty,

    #[error("server name '{0}' is not a fully qualified domain")]
    NotQualified(String),

    #[error("server name '{0}' is nested more than one label under the base domain")]
    TooDeep(String),
}

/// Persistent certificate cache failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record for {domain}: {reason}")]
    Corrupt { domain: String, reason: String },
}

/// Certificate issuance failures. Never cached; the next handshake retries.
///
/// `Clone` so one coalesced issuance result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssuanceError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("domain {0} is not allowed by the host policy")]
    NotAllowed(String),

    #[error("ACME error: {0}")]
    Ca(String),

    #[error("rate limited by CA: {0}")]
    RateLimited(String),

    #[error("challenge failed: {0}")]
    Challenge(String),

    #[error("issuance timed out after {0:?}")]
    Timeout(Duration),

    #[error("certificate cache unavailable: {0}")]
    Cache(String),

    #[error("issued certificate unusable: {0}")]
    BadCertificate(String),

    #[error("issuance task aborted: {0}")]
    Aborted(String),
}

/// RFC 8555 problem type returned when the CA throttles requests
pub const ACME_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";

impl IssuanceError {
    /// Map an ACME client error, recognizing rate-limit problem documents
    pub fn from_acme(err: instant_acme::Error) -> Self {
        match &err {
            instant_acme::Error::Api(problem)
                if problem.r#type.as_deref() == Some(ACME_RATE_LIMITED) =>
            {
                IssuanceError::RateLimited(err.to_string())
            }
            _ => IssuanceError::Ca(err.to_string()),
        }
    }
}

impl From<CacheError> for IssuanceError {
    fn from(err: CacheError) -> Self {
        IssuanceError::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(problem_type: &str, detail: &str) -> instant_acme::Error {
        let problem = serde_json::from_value(serde_json::json!({
            "type": problem_type,
            "detail": detail,
            "status": 429,
        }))
        .unwrap();
        instant_acme::Error::Api(problem)
    }

    #[test]
    fn test_rate_limit_detection() {
        let err = IssuanceError::from_acme(api_error(
            ACME_RATE_LIMITED,
            "too many certificates already issued",
        ));
        assert!(matches!(err, IssuanceError::RateLimited(_)));

        // Only the problem type counts, not the wording of the detail
        let err = IssuanceError::from_acme(api_error(
            "urn:ietf:params:acme:error:malformed",
            "too many dots in identifier",
        ));
        assert!(matches!(err, IssuanceError::Ca(_)));

        let err = IssuanceError::from_acme(instant_acme::Error::Str("rateLimited"));
        assert!(matches!(err, IssuanceError::Ca(_)));
    }

    #[test]
    fn test_cache_error_conversion() {
        let err: IssuanceError = CacheError::Corrupt {
            domain: "a.example.org".to_string(),
            reason: "truncated".to_string(),
        }
        .into();
        assert!(matches!(err, IssuanceError::Cache(ref m) if m.contains("a.example.org")));
    }
}
