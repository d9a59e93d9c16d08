//! Configuration structures and parsing for tenant-tls

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// HTTPS listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Tenancy settings (base domain and host mode)
    #[serde(default)]
    pub tenancy: TenancyConfig,

    /// Static certificate settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// ACME settings
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Certificate cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        debug!(path = ?path.as_ref(), "Loading configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Validation(
                    "tls.cert_path and tls.key_path must be set together".to_string(),
                ));
            }
            _ => {}
        }

        if self.acme.enabled && self.acme.email.trim().is_empty() {
            return Err(ConfigError::Validation(
                "ACME is enabled but no email is configured".to_string(),
            ));
        }

        if self.tenancy.host_mode == HostMode::Multi {
            let base = self.tenancy.base_domain.trim().trim_matches('.');
            if base.is_empty() || !base.contains('.') {
                return Err(ConfigError::Validation(format!(
                    "Multi-tenant mode requires a base domain with at least two labels, got '{}'",
                    self.tenancy.base_domain
                )));
            }
        }

        if self.server.handshake_timeout_secs == 0 || self.server.client_hello_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Handshake timeouts must be greater than zero".to_string(),
            ));
        }

        if !(1..=MAX_RENEW_BEFORE_DAYS).contains(&self.acme.renew_before_days) {
            return Err(ConfigError::Validation(format!(
                "acme.renew_before_days must be between 1 and {}, got {}",
                MAX_RENEW_BEFORE_DAYS, self.acme.renew_before_days
            )));
        }

        if self.acme.renewal_check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "acme.renewal_check_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Immutable view of the tenancy settings used for hostname validation
    pub fn domain_config(&self) -> DomainConfig {
        DomainConfig::new(&self.tenancy.base_domain, self.tenancy.host_mode)
    }

    /// Static certificate paths, if configured
    pub fn static_cert_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OpenTelemetry tracing configuration
    #[serde(default)]
    pub tracing: TracingConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tracing: TracingConfig::default(),
        }
    }
}

/// OpenTelemetry tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Enable OpenTelemetry tracing
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint (e.g., "http://localhost:4317")
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Sampling ratio (0.0 to 1.0, default: 1.0 = sample everything)
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "tenant-tls".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

/// HTTPS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the TLS listener
    #[serde(default = "default_https_listen")]
    pub https_listen: String,

    /// Plaintext address decrypted connections are relayed to
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// ALPN protocols offered during the handshake
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,

    /// Upper bound on certificate resolution for a single handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Upper bound on receiving the ClientHello after accept
    #[serde(default = "default_client_hello_timeout")]
    pub client_hello_timeout_secs: u64,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn client_hello_timeout(&self) -> Duration {
        Duration::from_secs(self.client_hello_timeout_secs)
    }
}

fn default_https_listen() -> String {
    "0.0.0.0:443".to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_alpn() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_client_hello_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            https_listen: default_https_listen(),
            upstream: default_upstream(),
            alpn: default_alpn(),
            handshake_timeout_secs: default_handshake_timeout(),
            client_hello_timeout_secs: default_client_hello_timeout(),
        }
    }
}

/// Whether the whole installation belongs to one tenant or to many
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMode {
    /// One tenant owns every hostname served
    Single,
    /// Tenants live one label under the base domain, plus custom domains
    #[default]
    Multi,
}

/// Tenancy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenancyConfig {
    #[serde(default)]
    pub host_mode: HostMode,

    /// Platform domain tenants are hosted under (e.g. "example.com")
    #[serde(default)]
    pub base_domain: String,
}

/// Immutable tenancy settings handed to the hostname validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    base_domain: String,
    host_mode: HostMode,
}

impl DomainConfig {
    /// Build a domain config; the base domain is lowercased and stripped of
    /// surrounding dots
    pub fn new(base_domain: &str, host_mode: HostMode) -> Self {
        Self {
            base_domain: base_domain.trim().trim_matches('.').to_ascii_lowercase(),
            host_mode,
        }
    }

    pub fn multi_tenant(base_domain: &str) -> Self {
        Self::new(base_domain, HostMode::Multi)
    }

    pub fn single_tenant(base_domain: &str) -> Self {
        Self::new(base_domain, HostMode::Single)
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    pub fn host_mode(&self) -> HostMode {
        self.host_mode
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.host_mode == HostMode::Multi
    }
}

/// Static certificate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain covering the platform domain
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM private key matching `cert_path`
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// ACME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Issue certificates for custom domains on demand
    #[serde(default = "default_acme_enabled")]
    pub enabled: bool,

    /// CA provider name or directory URL
    #[serde(default = "default_acme_ca")]
    pub ca: String,

    /// ACME account email
    #[serde(default)]
    pub email: String,

    /// Address of the HTTP-01 challenge listener
    #[serde(default = "default_challenge_listen")]
    pub challenge_listen: String,

    /// Redirect plain HTTP requests that are not challenges to HTTPS
    #[serde(default = "default_redirect_to_https")]
    pub redirect_to_https: bool,

    /// Treat cached certificates expiring within this many days as missing
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,

    /// How often the background renewal pass runs
    #[serde(default = "default_renewal_check_interval")]
    pub renewal_check_interval_secs: u64,

    /// Directory for ACME account credentials
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

impl AcmeConfig {
    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_interval_secs)
    }
}

fn default_acme_enabled() -> bool {
    true
}

fn default_acme_ca() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_challenge_listen() -> String {
    "0.0.0.0:80".to_string()
}

fn default_redirect_to_https() -> bool {
    true
}

fn default_renew_before_days() -> i64 {
    30
}

/// Longest renewal window accepted; CA certificates commonly last 90 days
const MAX_RENEW_BEFORE_DAYS: i64 = 60;

fn default_renewal_check_interval() -> u64 {
    12 * 3600
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./certs")
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: default_acme_enabled(),
            ca: default_acme_ca(),
            email: String::new(),
            challenge_listen: default_challenge_listen(),
            redirect_to_https: default_redirect_to_https(),
            renew_before_days: default_renew_before_days(),
            renewal_check_interval_secs: default_renewal_check_interval(),
            storage_path: default_storage_path(),
        }
    }
}

/// Certificate cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// One JSON document per domain in a directory
    #[default]
    File,
    /// SQLite table
    Sqlite,
    /// In-process only, lost on restart
    Memory,
}

/// Certificate cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Directory (file backend) or database path/URL (sqlite backend)
    #[serde(default = "default_cache_path")]
    pub path: String,
}

fn default_cache_path() -> String {
    "./certs".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            path: default_cache_path(),
        }
    }
}
