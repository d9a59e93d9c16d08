//! Certificate renewal scheduler
//!
//! Periodically walks the certificate cache and re-issues certificates that
//! are inside the renewal window, so handshakes rarely wait on the CA.

use crate::issuer::CertificateIssuer;
use crate::manager::CertificateSource;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default renewal check interval (12 hours)
const DEFAULT_CHECK_INTERVAL_HOURS: u64 = 12;

/// Certificate renewal scheduler
pub struct RenewalScheduler {
    issuer: Arc<CertificateIssuer>,
    check_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

/// Counts from one pass over the cache
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenewalReport {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
}

impl RenewalScheduler {
    /// Create a new renewal scheduler
    pub fn new(issuer: Arc<CertificateIssuer>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            issuer,
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_HOURS * 3600),
            shutdown_rx,
        }
    }

    /// Set custom check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Start the renewal scheduler (runs in background)
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            renew_before_days = self.issuer.renew_before().num_days(),
            "Certificate renewal scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {
                    self.check_and_renew().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Renewal scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check every cached certificate and renew the ones close to expiry
    pub async fn check_and_renew(&self) -> RenewalReport {
        debug!("Checking certificates for renewal");
        let mut report = RenewalReport::default();

        let domains = match self.issuer.cache().list_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                error!(error = %e, "Failed to list cached certificates");
                return report;
            }
        };

        for domain in domains {
            report.checked += 1;

            let record = match self.issuer.cache().get(&domain).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!(domain = %domain, error = %e, "Failed to load certificate");
                    report.failed += 1;
                    continue;
                }
            };

            let days_left = (record.expires_at - Utc::now()).num_days();
            if !self.issuer.needs_renewal(&record) {
                debug!(domain = %domain, days_left = days_left, "Certificate still valid");
                continue;
            }

            info!(
                domain = %domain,
                days_left = days_left,
                "Certificate expiring soon, initiating renewal"
            );
            match self.issuer.renew(&domain).await {
                Ok((_, CertificateSource::Issued)) => {
                    info!(domain = %domain, "Certificate renewed successfully");
                    report.renewed += 1;
                }
                Ok(_) => {
                    warn!(domain = %domain, "Renewal found a newer certificate already cached");
                }
                Err(e) => {
                    error!(domain = %domain, error = %e, "Failed to renew certificate");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// Create a shutdown channel pair
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
