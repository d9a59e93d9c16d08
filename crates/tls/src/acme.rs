//! ACME client for on-demand certificate issuance
//!
//! [`CertificateAuthority`] is the seam the issuer talks to; [`AcmeAuthority`]
//! is the production implementation on top of `instant-acme` using HTTP-01.

use crate::challenge::{ChallengeGuard, ChallengeTokens};
use crate::error::IssuanceError;
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Maximum time allowed for a complete ACME certificate acquisition (5 minutes)
const ACME_TOTAL_TIMEOUT_SECS: u64 = 300;

/// Order polling: attempts × interval bounds each wait
const POLL_ATTEMPTS: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Let's Encrypt production CA
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging CA (for testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// ZeroSSL production CA
pub const ZEROSSL_PRODUCTION: &str = "https://acme.zerossl.com/v2/DV90";

/// Google Trust Services production CA
pub const GOOGLE_TRUST_SERVICES: &str = "https://dv.acme-v02.api.pki.goog/directory";

/// Resolve ACME CA URL from provider name or direct URL
///
/// Supported provider names (case-insensitive): `letsencrypt`/`le`,
/// `letsencrypt-staging`/`le-staging`/`staging`, `zerossl`, `google`/`gts`.
/// Anything starting with `http://` or `https://` is returned as-is.
pub fn resolve_acme_ca(provider_or_url: &str) -> String {
    let normalized = provider_or_url.trim().to_lowercase();

    if normalized.starts_with("http://") || normalized.starts_with("https://") {
        return provider_or_url.trim().to_string();
    }

    match normalized.as_str() {
        "letsencrypt" | "le" => LETS_ENCRYPT_PRODUCTION.to_string(),
        "letsencrypt-staging" | "le-staging" | "staging" => LETS_ENCRYPT_STAGING.to_string(),
        "zerossl" => ZEROSSL_PRODUCTION.to_string(),
        "google" | "gts" => GOOGLE_TRUST_SERVICES.to_string(),
        _ => {
            warn!(
                provider = %provider_or_url,
                "Unknown ACME provider, defaulting to Let's Encrypt"
            );
            LETS_ENCRYPT_PRODUCTION.to_string()
        }
    }
}

/// Get a human-readable name for an ACME CA URL
pub fn get_acme_ca_name(url: &str) -> &'static str {
    match url {
        LETS_ENCRYPT_PRODUCTION => "Let's Encrypt",
        LETS_ENCRYPT_STAGING => "Let's Encrypt (Staging)",
        ZEROSSL_PRODUCTION => "ZeroSSL",
        GOOGLE_TRUST_SERVICES => "Google Trust Services",
        _ => "Custom CA",
    }
}

/// Validate domain name format before any CA traffic
pub fn validate_domain(domain: &str) -> Result<(), IssuanceError> {
    if domain.is_empty() {
        return Err(IssuanceError::InvalidDomain(
            "Domain name cannot be empty".to_string(),
        ));
    }

    // Max 253 characters for DNS names
    if domain.len() > 253 {
        return Err(IssuanceError::InvalidDomain(format!(
            "Domain name too long: {} characters",
            domain.len()
        )));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(IssuanceError::InvalidDomain(format!(
            "Domain must have at least two labels: {}",
            domain
        )));
    }

    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err(IssuanceError::InvalidDomain(format!(
                "Invalid label length in domain: {}",
                domain
            )));
        }

        if !label
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        {
            return Err(IssuanceError::InvalidDomain(format!(
                "Domain label must start with alphanumeric: {}",
                domain
            )));
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(IssuanceError::InvalidDomain(format!(
                "Invalid characters in domain: {}",
                domain
            )));
        }

        if label.ends_with('-') {
            return Err(IssuanceError::InvalidDomain(format!(
                "Domain label cannot end with hyphen: {}",
                domain
            )));
        }
    }

    if let Some(tld) = labels.last() {
        if tld.chars().all(|c| c.is_ascii_digit()) {
            return Err(IssuanceError::InvalidDomain(format!(
                "TLD cannot be all numeric: {}",
                domain
            )));
        }
    }

    Ok(())
}

/// PEM material returned by a CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Leaf first, then intermediates
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Something that can prove control of a domain and return a certificate
/// for it. Implementations register HTTP-01 tokens in `challenges` for the
/// duration of the validation and must leave none behind.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn obtain_certificate(
        &self,
        domain: &str,
        challenges: &ChallengeTokens,
    ) -> Result<IssuedCertificate, IssuanceError>;
}

/// ACME (RFC 8555) authority using HTTP-01
pub struct AcmeAuthority {
    ca_url: String,
    email: String,
    storage_path: PathBuf,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    /// `storage_path` holds the persisted account credentials
    pub fn new(ca_url: String, email: String, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            ca_url,
            email,
            storage_path: storage_path.into(),
            account: OnceCell::new(),
        }
    }

    pub fn ca_url(&self) -> &str {
        &self.ca_url
    }

    fn account_path(&self) -> PathBuf {
        self.storage_path
            .join("accounts")
            .join(format!("{}.json", simple_hash(&format!("{}|{}", self.ca_url, self.email))))
    }

    /// Load persisted account credentials or register a new account
    async fn account(&self) -> Result<&Account, IssuanceError> {
        self.account
            .get_or_try_init(|| async {
                let path = self.account_path();

                if let Ok(json) = tokio::fs::read_to_string(&path).await {
                    match serde_json::from_str::<AccountCredentials>(&json) {
                        Ok(credentials) => {
                            debug!(path = ?path, "Loaded ACME account credentials");
                            return Account::from_credentials(credentials)
                                .await
                                .map_err(IssuanceError::from_acme);
                        }
                        Err(e) => {
                            warn!(
                                path = ?path,
                                error = %e,
                                "Ignoring unreadable ACME account credentials"
                            );
                        }
                    }
                }

                info!(email = %self.email, ca = %self.ca_url, "Creating ACME account");
                let contact = format!("mailto:{}", self.email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[contact.as_str()],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.ca_url,
                    None,
                )
                .await
                .map_err(IssuanceError::from_acme)?;

                if let Err(e) = self.store_credentials(&credentials).await {
                    warn!(path = ?path, error = %e, "Failed to persist ACME account credentials");
                }

                Ok(account)
            })
            .await
    }

    async fn store_credentials(&self, credentials: &AccountCredentials) -> std::io::Result<()> {
        let path = self.account_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(credentials)?;
        tokio::fs::write(&path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    /// Internal certificate acquisition (without timeout wrapper)
    async fn obtain_inner(
        &self,
        domain: &str,
        challenges: &ChallengeTokens,
    ) -> Result<IssuedCertificate, IssuanceError> {
        info!(domain = %domain, "Obtaining certificate via ACME");

        let account = self.account().await?;

        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(IssuanceError::from_acme)?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(IssuanceError::from_acme)?;

        // Tokens stay registered until validation has finished either way
        let mut guards: Vec<ChallengeGuard> = Vec::new();
        for auth in &authorizations {
            match auth.status {
                AuthorizationStatus::Pending => {
                    let challenge = auth
                        .challenges
                        .iter()
                        .find(|c| c.r#type == ChallengeType::Http01)
                        .ok_or_else(|| {
                            IssuanceError::Challenge("No HTTP-01 challenge offered".to_string())
                        })?;

                    let key_auth = order.key_authorization(challenge);
                    guards.push(challenges.register(&challenge.token, key_auth.as_str()));

                    order
                        .set_challenge_ready(&challenge.url)
                        .await
                        .map_err(IssuanceError::from_acme)?;
                }
                AuthorizationStatus::Valid => {
                    debug!(domain = %domain, "Authorization already valid");
                }
                status => {
                    return Err(IssuanceError::Challenge(format!(
                        "Unexpected authorization status: {:?}",
                        status
                    )));
                }
            }
        }

        wait_for_status(&mut order, domain, |s| {
            matches!(s, OrderStatus::Ready | OrderStatus::Valid)
        })
        .await?;
        drop(guards);

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| IssuanceError::Ca(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();

        let key_pair = KeyPair::generate().map_err(|e| IssuanceError::Ca(e.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| IssuanceError::Ca(e.to_string()))?;

        order
            .finalize(csr.der())
            .await
            .map_err(IssuanceError::from_acme)?;

        let cert_chain = download_certificate(&mut order).await?;

        info!(domain = %domain, "Certificate obtained successfully");
        Ok(IssuedCertificate {
            certificate_pem: cert_chain,
            private_key_pem: key_pair.serialize_pem(),
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn obtain_certificate(
        &self,
        domain: &str,
        challenges: &ChallengeTokens,
    ) -> Result<IssuedCertificate, IssuanceError> {
        validate_domain(domain)?;

        let timeout = Duration::from_secs(ACME_TOTAL_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, self.obtain_inner(domain, challenges)).await {
            Ok(result) => result,
            Err(_) => Err(IssuanceError::Timeout(timeout)),
        }
    }
}

/// Poll the order until `done` accepts its status
async fn wait_for_status(
    order: &mut Order,
    domain: &str,
    done: impl Fn(&OrderStatus) -> bool,
) -> Result<(), IssuanceError> {
    for attempt in 0..POLL_ATTEMPTS {
        tokio::time::sleep(POLL_INTERVAL).await;

        let state = order.refresh().await.map_err(IssuanceError::from_acme)?;
        if done(&state.status) {
            return Ok(());
        }

        match state.status {
            OrderStatus::Invalid => {
                return Err(IssuanceError::Challenge(format!(
                    "Order for {} became invalid",
                    domain
                )));
            }
            _ => debug!(domain = %domain, attempt = attempt + 1, "Waiting for order"),
        }
    }

    Err(IssuanceError::Challenge(format!(
        "Order for {} did not become ready in time",
        domain
    )))
}

async fn download_certificate(order: &mut Order) -> Result<String, IssuanceError> {
    for _ in 0..POLL_ATTEMPTS {
        if let Some(chain) = order
            .certificate()
            .await
            .map_err(IssuanceError::from_acme)?
        {
            return Ok(chain);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(IssuanceError::Ca("No certificate returned".to_string()))
}

/// Simple hash for filenames
fn simple_hash(s: &str) -> String {
    use base64::Engine;
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&result[..12])
}
