//! On-demand certificate issuance for custom domains
//!
//! Serves cached certificates when they are usable, otherwise obtains a new
//! one from the [`CertificateAuthority`] and writes it back to the cache.
//! Issuance for a domain runs at most once at a time: later callers join the
//! in-flight attempt. The attempt runs in its own task, so a caller giving up
//! (handshake timeout, client disconnect) never aborts it.

use crate::acme::{validate_domain, CertificateAuthority};
use crate::cache::{CachedCertificate, CertCache};
use crate::certificate::parse_pem_pair;
use crate::challenge::ChallengeTokens;
use crate::error::IssuanceError;
use crate::manager::CertificateSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default days before expiry a cached certificate is replaced
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// Upper bound accepted by [`CertificateIssuer::with_renew_before_days`]
const MAX_RENEW_BEFORE_DAYS: i64 = 365;

/// Decides whether a custom domain may have a certificate issued at all
#[async_trait]
pub trait HostPolicy: Send + Sync {
    async fn allow(&self, domain: &str) -> bool;
}

/// Accepts every syntactically valid domain
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl HostPolicy for AllowAll {
    async fn allow(&self, _domain: &str) -> bool {
        true
    }
}

pub type Obtained = (Arc<CertifiedKey>, CertificateSource);

type SharedIssuance = Shared<BoxFuture<'static, Result<Obtained, IssuanceError>>>;

/// Parsed form of the cached record last seen for a domain
struct Loaded {
    certificate_pem: String,
    key: Arc<CertifiedKey>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// Automatic certificate issuer
pub struct CertificateIssuer {
    cache: Arc<dyn CertCache>,
    authority: Arc<dyn CertificateAuthority>,
    challenges: ChallengeTokens,
    policy: Arc<dyn HostPolicy>,
    renew_before: chrono::Duration,
    in_flight: DashMap<String, SharedIssuance>,
    loaded: DashMap<String, Arc<Loaded>>,
}

impl CertificateIssuer {
    pub fn new(
        cache: Arc<dyn CertCache>,
        authority: Arc<dyn CertificateAuthority>,
        challenges: ChallengeTokens,
    ) -> Self {
        Self {
            cache,
            authority,
            challenges,
            policy: Arc::new(AllowAll),
            renew_before: chrono::Duration::days(DEFAULT_RENEW_BEFORE_DAYS),
            in_flight: DashMap::new(),
            loaded: DashMap::new(),
        }
    }

    /// Restrict which custom domains may be issued
    pub fn with_policy(mut self, policy: Arc<dyn HostPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Set how long before expiry cached certificates are replaced.
    /// Clamped to `0..=365` days.
    pub fn with_renew_before_days(mut self, days: i64) -> Self {
        self.renew_before = chrono::Duration::days(days.clamp(0, MAX_RENEW_BEFORE_DAYS));
        self
    }

    pub fn cache(&self) -> &Arc<dyn CertCache> {
        &self.cache
    }

    pub fn challenges(&self) -> &ChallengeTokens {
        &self.challenges
    }

    pub fn renew_before(&self) -> chrono::Duration {
        self.renew_before
    }

    /// Renewal margin for a certificate valid over `lifetime`: the configured
    /// window, capped at a third of the lifetime so that a newly issued
    /// certificate is never already due
    pub fn renewal_margin(&self, lifetime: chrono::Duration) -> chrono::Duration {
        self.renew_before.min(lifetime / 3).max(chrono::Duration::zero())
    }

    /// Whether a cached record has entered its renewal window
    pub fn needs_renewal(&self, record: &CachedCertificate) -> bool {
        let margin = self.renewal_margin(record.expires_at - record.created_at);
        record.expires_at - margin <= Utc::now()
    }

    /// Number of domains with an issuance currently running
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Certificate for `domain`: from the cache when usable, otherwise issued
    pub async fn get_certificate(
        self: &Arc<Self>,
        domain: &str,
    ) -> Result<Obtained, IssuanceError> {
        if let Some(key) = self.cached(domain).await? {
            debug!(domain = %domain, "Certificate served from cache");
            return Ok((key, CertificateSource::Cache));
        }
        self.issue(domain).await
    }

    /// Re-issue if the cached certificate is missing or inside the renewal
    /// window; joins an in-flight issuance if there is one
    pub async fn renew(self: &Arc<Self>, domain: &str) -> Result<Obtained, IssuanceError> {
        self.issue(domain).await
    }

    /// Usable cached certificate, if any
    async fn cached(&self, domain: &str) -> Result<Option<Arc<CertifiedKey>>, IssuanceError> {
        let record = match self.cache.get(domain).await {
            Ok(record) => record,
            Err(e) => {
                error!(domain = %domain, error = %e, "Certificate cache lookup failed");
                return Err(e.into());
            }
        };
        Ok(record.and_then(|r| self.usable(domain, &r)))
    }

    fn usable(&self, domain: &str, record: &CachedCertificate) -> Option<Arc<CertifiedKey>> {
        if let Some(loaded) = self.loaded.get(domain) {
            if loaded.certificate_pem == record.certificate_pem {
                return self.fresh(domain, &loaded);
            }
        }

        let parsed = match parse_pem_pair(&record.certificate_pem, &record.private_key_pem) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Cached certificate unreadable, reissuing");
                return None;
            }
        };
        if !parsed.leaf.matches(domain) {
            warn!(
                domain = %domain,
                names = ?parsed.leaf.dns_names,
                "Cached certificate does not cover domain, reissuing"
            );
            return None;
        }

        let loaded = Arc::new(Loaded {
            certificate_pem: record.certificate_pem.clone(),
            key: parsed.key,
            not_before: parsed.leaf.not_before,
            not_after: parsed.leaf.not_after,
        });
        self.loaded.insert(domain.to_string(), loaded.clone());
        self.fresh(domain, &loaded)
    }

    fn fresh(&self, domain: &str, loaded: &Loaded) -> Option<Arc<CertifiedKey>> {
        let margin = self.renewal_margin(loaded.not_after - loaded.not_before);
        if loaded.not_after - margin > Utc::now() {
            Some(loaded.key.clone())
        } else {
            info!(
                domain = %domain,
                expires_at = %loaded.not_after,
                "Cached certificate inside renewal window"
            );
            None
        }
    }

    /// Start or join the issuance for `domain`
    async fn issue(self: &Arc<Self>, domain: &str) -> Result<Obtained, IssuanceError> {
        validate_domain(domain)?;

        let shared = match self.in_flight.entry(domain.to_string()) {
            Entry::Occupied(entry) => {
                debug!(domain = %domain, "Joining in-flight issuance");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let issuer = Arc::clone(self);
                let owned = domain.to_string();
                let task = tokio::spawn(async move {
                    let _done = InFlightGuard {
                        in_flight: &issuer.in_flight,
                        domain: &owned,
                    };
                    issuer.issue_now(&owned).await
                });
                let shared = async move {
                    task.await
                        .unwrap_or_else(|e| Err(IssuanceError::Aborted(e.to_string())))
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    async fn issue_now(&self, domain: &str) -> Result<Obtained, IssuanceError> {
        // Another replica, or an attempt that finished just before this one
        // started, may already have stored a fresh certificate
        if let Some(key) = self.cached(domain).await? {
            return Ok((key, CertificateSource::Cache));
        }

        if !self.policy.allow(domain).await {
            warn!(domain = %domain, "Host policy refused certificate issuance");
            return Err(IssuanceError::NotAllowed(domain.to_string()));
        }

        info!(domain = %domain, "Issuing certificate");
        let issued = match self
            .authority
            .obtain_certificate(domain, &self.challenges)
            .await
        {
            Ok(issued) => issued,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Certificate issuance failed");
                return Err(e);
            }
        };

        let parsed = parse_pem_pair(&issued.certificate_pem, &issued.private_key_pem)
            .map_err(IssuanceError::BadCertificate)?;
        if !parsed.leaf.matches(domain) {
            return Err(IssuanceError::BadCertificate(format!(
                "issued certificate covers {:?}, not {}",
                parsed.leaf.dns_names, domain
            )));
        }

        let record = CachedCertificate {
            domain: domain.to_string(),
            certificate_pem: issued.certificate_pem,
            private_key_pem: issued.private_key_pem,
            expires_at: parsed.leaf.not_after,
            created_at: Utc::now(),
        };
        if let Err(e) = self.cache.put(domain, &record).await {
            error!(domain = %domain, error = %e, "Failed to store issued certificate");
        }

        self.loaded.insert(
            domain.to_string(),
            Arc::new(Loaded {
                certificate_pem: record.certificate_pem,
                key: parsed.key.clone(),
                not_before: parsed.leaf.not_before,
                not_after: parsed.leaf.not_after,
            }),
        );

        info!(domain = %domain, expires_at = %parsed.leaf.not_after, "Certificate issued");
        Ok((parsed.key, CertificateSource::Issued))
    }
}

/// Clears the in-flight entry when the issuance task ends, including by panic
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, SharedIssuance>,
    domain: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(self.domain);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::acme::IssuedCertificate;
    use crate::certificate::test_support::self_signed_between;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-process CA: signs whatever it is asked for, counting calls
    pub struct FakeAuthority {
        pub calls: AtomicUsize,
        pub failures_left: AtomicUsize,
        pub delay: Duration,
        pub validity_days: i64,
        pub saw_token: AtomicUsize,
    }

    impl FakeAuthority {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                validity_days: 90,
                saw_token: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing(self, times: usize) -> Self {
            self.failures_left.store(times, Ordering::SeqCst);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CertificateAuthority for FakeAuthority {
        async fn obtain_certificate(
            &self,
            domain: &str,
            challenges: &ChallengeTokens,
        ) -> Result<IssuedCertificate, IssuanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let token = format!("token-{}", domain);
            let _guard = challenges.register(&token, &format!("{}.thumbprint", token));
            if challenges.get(&token).is_some() {
                self.saw_token.fetch_add(1, Ordering::SeqCst);
            }

            tokio::time::sleep(self.delay).await;

            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(IssuanceError::RateLimited("too many certificates".to_string()));
            }

            let now = Utc::now();
            let (certificate_pem, private_key_pem) = self_signed_between(
                &[domain],
                now - chrono::Duration::hours(1),
                now + chrono::Duration::days(self.validity_days),
            );
            Ok(IssuedCertificate {
                certificate_pem,
                private_key_pem,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeAuthority;
    use super::*;
    use crate::cache::MemoryCertCache;
    use crate::certificate::test_support::{self_signed, self_signed_until};
    use crate::error::CacheError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn issuer(cache: Arc<dyn CertCache>, ca: Arc<FakeAuthority>) -> Arc<CertificateIssuer> {
        Arc::new(CertificateIssuer::new(cache, ca, ChallengeTokens::new()))
    }

    fn stored(domain: &str, days: i64) -> CachedCertificate {
        let expires_at = Utc::now() + chrono::Duration::days(days);
        let (certificate_pem, private_key_pem) = self_signed_until(&[domain], expires_at);
        CachedCertificate {
            domain: domain.to_string(),
            certificate_pem,
            private_key_pem,
            expires_at,
            created_at: Utc::now(),
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl CertCache for BrokenCache {
        async fn get(&self, _: &str) -> Result<Option<CachedCertificate>, CacheError> {
            Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "store unreachable",
            )))
        }
        async fn put(&self, _: &str, _: &CachedCertificate) -> Result<(), CacheError> {
            Ok(())
        }
        async fn delete(&self, _: &str) -> Result<(), CacheError> {
            Ok(())
        }
        async fn list_domains(&self) -> Result<Vec<String>, CacheError> {
            Ok(Vec::new())
        }
    }

    /// Panics on its first call, allows afterwards
    #[derive(Default)]
    struct PanicOnce {
        tripped: AtomicBool,
    }

    #[async_trait]
    impl HostPolicy for PanicOnce {
        async fn allow(&self, _: &str) -> bool {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("policy backend crashed");
            }
            true
        }
    }

    struct DenyAll;

    #[async_trait]
    impl HostPolicy for DenyAll {
        async fn allow(&self, _: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_ca() {
        let cache = Arc::new(MemoryCertCache::new());
        cache
            .put("custom.vanity.tld", &stored("custom.vanity.tld", 60))
            .await
            .unwrap();
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(cache, ca.clone());

        let (_, source) = issuer.get_certificate("custom.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Cache);
        assert_eq!(ca.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_issues_and_populates_cache() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(cache.clone(), ca.clone());

        let (key, source) = issuer.get_certificate("custom.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Issued);
        assert_eq!(ca.calls(), 1);
        assert_eq!(ca.saw_token.load(Ordering::SeqCst), 1);
        assert_eq!(issuer.challenges().pending_count(), 0);
        assert_eq!(issuer.in_flight_count(), 0);

        let record = cache.get("custom.vanity.tld").await.unwrap().unwrap();
        assert_eq!(record.domain, "custom.vanity.tld");
        assert_eq!(
            key.cert[0].as_ref(),
            crate::certificate::parse_pem_pair(&record.certificate_pem, &record.private_key_pem)
                .unwrap()
                .key
                .cert[0]
                .as_ref()
        );
    }

    #[tokio::test]
    async fn test_repeat_requests_served_from_cache() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(cache, ca.clone());

        let (first, _) = issuer.get_certificate("custom.vanity.tld").await.unwrap();
        let (second, source) = issuer.get_certificate("custom.vanity.tld").await.unwrap();
        let (third, _) = issuer.get_certificate("custom.vanity.tld").await.unwrap();

        assert_eq!(source, CertificateSource::Cache);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(ca.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_issue_once() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = Arc::new(FakeAuthority::new().with_delay(Duration::from_millis(200)));
        let issuer = issuer(cache, ca.clone());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let issuer = issuer.clone();
            handles.push(tokio::spawn(async move {
                issuer.get_certificate("burst.vanity.tld").await
            }));
        }

        let mut keys = Vec::new();
        for handle in handles {
            let (key, _) = handle.await.unwrap().unwrap();
            keys.push(key);
        }

        assert_eq!(ca.calls(), 1);
        let first = keys[0].cert[0].as_ref().to_vec();
        assert!(keys.iter().all(|k| k.cert[0].as_ref() == first.as_slice()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_domains_issue_independently() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = Arc::new(FakeAuthority::new().with_delay(Duration::from_millis(100)));
        let issuer = issuer(cache, ca.clone());

        let (a, b) = tokio::join!(
            issuer.get_certificate("one.vanity.tld"),
            issuer.get_certificate("two.vanity.tld")
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(ca.calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = Arc::new(FakeAuthority::new().failing(1));
        let issuer = issuer(cache.clone(), ca.clone());

        let err = issuer.get_certificate("flaky.vanity.tld").await.unwrap_err();
        assert!(matches!(err, IssuanceError::RateLimited(_)));
        assert!(cache.get("flaky.vanity.tld").await.unwrap().is_none());
        assert_eq!(issuer.challenges().pending_count(), 0);

        let (_, source) = issuer.get_certificate("flaky.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Issued);
        assert_eq!(ca.calls(), 2);
    }

    #[tokio::test]
    async fn test_expiring_record_is_reissued() {
        let cache = Arc::new(MemoryCertCache::new());
        let old = stored("renew.vanity.tld", 10);
        cache.put("renew.vanity.tld", &old).await.unwrap();
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(cache.clone(), ca.clone());

        let (_, source) = issuer.get_certificate("renew.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Issued);
        assert_eq!(ca.calls(), 1);

        let replaced = cache.get("renew.vanity.tld").await.unwrap().unwrap();
        assert_ne!(replaced.certificate_pem, old.certificate_pem);
        assert!(replaced.expires_at > old.expires_at);
    }

    #[tokio::test]
    async fn test_custom_renewal_window() {
        let cache = Arc::new(MemoryCertCache::new());
        cache
            .put("short.vanity.tld", &stored("short.vanity.tld", 10))
            .await
            .unwrap();
        let ca = Arc::new(FakeAuthority::new());
        let issuer = Arc::new(
            CertificateIssuer::new(cache, ca.clone(), ChallengeTokens::new())
                .with_renew_before_days(5),
        );

        let (_, source) = issuer.get_certificate("short.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Cache);
        assert_eq!(ca.calls(), 0);
    }

    #[tokio::test]
    async fn test_window_wider_than_lifetime_is_capped() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = Arc::new(FakeAuthority::new());
        let issuer = Arc::new(
            CertificateIssuer::new(cache, ca.clone(), ChallengeTokens::new())
                .with_renew_before_days(90),
        );

        let (_, first) = issuer.get_certificate("custom.vanity.tld").await.unwrap();
        let (_, second) = issuer.get_certificate("custom.vanity.tld").await.unwrap();
        let (_, third) = issuer.get_certificate("custom.vanity.tld").await.unwrap();

        assert_eq!(first, CertificateSource::Issued);
        assert_eq!(second, CertificateSource::Cache);
        assert_eq!(third, CertificateSource::Cache);
        assert_eq!(ca.calls(), 1);
    }

    #[test]
    fn test_renewal_margin_bounds() {
        let issuer = CertificateIssuer::new(
            Arc::new(MemoryCertCache::new()),
            Arc::new(FakeAuthority::new()),
            ChallengeTokens::new(),
        );
        let ninety = chrono::Duration::days(90);
        assert_eq!(issuer.renewal_margin(ninety), chrono::Duration::days(30));
        assert_eq!(issuer.renewal_margin(chrono::Duration::days(6)), chrono::Duration::days(2));
        assert_eq!(issuer.renewal_margin(-ninety), chrono::Duration::zero());

        let huge = CertificateIssuer::new(
            Arc::new(MemoryCertCache::new()),
            Arc::new(FakeAuthority::new()),
            ChallengeTokens::new(),
        )
        .with_renew_before_days(i64::MAX);
        assert_eq!(huge.renew_before(), chrono::Duration::days(365));

        let negative = CertificateIssuer::new(
            Arc::new(MemoryCertCache::new()),
            Arc::new(FakeAuthority::new()),
            ChallengeTokens::new(),
        )
        .with_renew_before_days(-10);
        assert_eq!(negative.renewal_margin(ninety), chrono::Duration::zero());
    }

    #[tokio::test]
    async fn test_record_with_foreign_key_is_reissued() {
        let cache = Arc::new(MemoryCertCache::new());
        let mut record = stored("mine.vanity.tld", 60);
        record.private_key_pem = stored("mine.vanity.tld", 60).private_key_pem;
        cache.put("mine.vanity.tld", &record).await.unwrap();
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(cache.clone(), ca.clone());

        let (key, source) = issuer.get_certificate("mine.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Issued);
        assert!(key.keys_match().is_ok());
        assert_eq!(ca.calls(), 1);

        let replaced = cache.get("mine.vanity.tld").await.unwrap().unwrap();
        assert_ne!(replaced.certificate_pem, record.certificate_pem);
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_retried() {
        let ca = Arc::new(FakeAuthority::new());
        let issuer = Arc::new(
            CertificateIssuer::new(
                Arc::new(MemoryCertCache::new()),
                ca.clone(),
                ChallengeTokens::new(),
            )
            .with_policy(Arc::new(PanicOnce::default())),
        );

        let err = issuer.get_certificate("custom.vanity.tld").await.unwrap_err();
        assert!(matches!(err, IssuanceError::Aborted(_)));
        assert_eq!(issuer.in_flight_count(), 0);
        assert_eq!(ca.calls(), 0);

        let (_, source) = issuer.get_certificate("custom.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Issued);
        assert_eq!(ca.calls(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_record_is_reissued() {
        let cache = Arc::new(MemoryCertCache::new());
        let (certificate_pem, private_key_pem) = self_signed(&["someone-else.tld"]);
        cache
            .put(
                "mine.vanity.tld",
                &CachedCertificate {
                    domain: "mine.vanity.tld".to_string(),
                    certificate_pem,
                    private_key_pem,
                    expires_at: Utc::now() + chrono::Duration::days(300),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(cache, ca.clone());

        let (key, source) = issuer.get_certificate("mine.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Issued);
        let leaf = crate::certificate::LeafInfo::from_der(key.cert[0].as_ref()).unwrap();
        assert!(leaf.matches("mine.vanity.tld"));
    }

    #[tokio::test]
    async fn test_invalid_domain_never_reaches_ca() {
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(Arc::new(MemoryCertCache::new()), ca.clone());

        let err = issuer.get_certificate("bad_name.vanity.tld").await.unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidDomain(_)));
        assert_eq!(ca.calls(), 0);
    }

    #[tokio::test]
    async fn test_host_policy_refusal() {
        let ca = Arc::new(FakeAuthority::new());
        let issuer = Arc::new(
            CertificateIssuer::new(
                Arc::new(MemoryCertCache::new()),
                ca.clone(),
                ChallengeTokens::new(),
            )
            .with_policy(Arc::new(DenyAll)),
        );

        let err = issuer.get_certificate("unknown.vanity.tld").await.unwrap_err();
        assert_eq!(err, IssuanceError::NotAllowed("unknown.vanity.tld".to_string()));
        assert_eq!(ca.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_failure_rejects() {
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(Arc::new(BrokenCache), ca.clone());

        let err = issuer.get_certificate("custom.vanity.tld").await.unwrap_err();
        assert!(matches!(err, IssuanceError::Cache(_)));
        assert_eq!(ca.calls(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_issuance() {
        let cache = Arc::new(MemoryCertCache::new());
        let ca = Arc::new(FakeAuthority::new().with_delay(Duration::from_millis(200)));
        let issuer = issuer(cache.clone(), ca.clone());

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            issuer.get_certificate("slow.vanity.tld"),
        )
        .await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cache.get("slow.vanity.tld").await.unwrap().is_some());
        assert_eq!(issuer.in_flight_count(), 0);

        let (_, source) = issuer.get_certificate("slow.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Cache);
        assert_eq!(ca.calls(), 1);
    }

    #[tokio::test]
    async fn test_renew_joins_cache_when_fresh() {
        let cache = Arc::new(MemoryCertCache::new());
        cache
            .put("fresh.vanity.tld", &stored("fresh.vanity.tld", 80))
            .await
            .unwrap();
        let ca = Arc::new(FakeAuthority::new());
        let issuer = issuer(cache, ca.clone());

        let (_, source) = issuer.renew("fresh.vanity.tld").await.unwrap();
        assert_eq!(source, CertificateSource::Cache);
        assert_eq!(ca.calls(), 0);
    }
}
