//! Server name validation and classification
//!
//! Runs first on every handshake. Pure: no I/O, no shared state.

use crate::error::ValidationError;
use config::DomainConfig;

/// Which certificate source a validated name is a candidate for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The base domain itself or a tenant subdomain of it
    PlatformDomain,
    /// Anything else: a tenant-supplied vanity domain
    CustomDomain,
}

/// A server name that passed validation, normalized to lowercase without a
/// trailing dot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedName {
    name: String,
    classification: Classification,
}

impl ValidatedName {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn is_custom(&self) -> bool {
        self.classification == Classification::CustomDomain
    }
}

/// Validate and classify a requested server name.
///
/// `static_configured` reflects whether a platform certificate is loaded; the
/// one-label depth rule under the base domain only applies then, and only in
/// multi-tenant mode. Names outside the base domain never hit the depth rule.
pub fn validate(
    server_name: &str,
    domain: &DomainConfig,
    static_configured: bool,
) -> Result<ValidatedName, ValidationError> {
    if server_name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if !server_name.trim_matches('.').contains('.') {
        return Err(ValidationError::NotQualified(server_name.to_string()));
    }

    let name = server_name.trim_end_matches('.').to_ascii_lowercase();

    let residual = subdomain_of(&name, domain.base_domain());

    if domain.is_multi_tenant() && static_configured {
        if let Some(prefix) = residual {
            if prefix.contains('.') {
                return Err(ValidationError::TooDeep(name));
            }
        }
    }

    let classification = match residual {
        Some(_) => Classification::PlatformDomain,
        None => Classification::CustomDomain,
    };

    Ok(ValidatedName {
        name,
        classification,
    })
}

/// Label prefix left after removing `.base` from `name`; empty when `name`
/// is the base domain; `None` when `name` is outside it
fn subdomain_of<'a>(name: &'a str, base: &str) -> Option<&'a str> {
    if base.is_empty() {
        return None;
    }
    if name == base {
        return Some("");
    }
    name.strip_suffix(base)?.strip_suffix('.')
}
