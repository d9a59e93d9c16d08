//! tenant-tls: TLS front door for multi-tenant hosting
//!
//! Terminates TLS for the platform's tenant subdomains with a static
//! certificate and for tenants' custom domains with certificates issued on
//! demand via ACME, then relays the decrypted traffic to the application.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tls::{
    get_acme_ca_name, open_cache, resolve_acme_ca, shutdown_channel, AcmeAuthority,
    CertificateIssuer, CertificateManager, ChallengeServer, ChallengeTokens, ForwardHandler,
    RenewalScheduler, StaticCertificateStore, TlsListener,
};
use tracing::{info, warn};

mod telemetry;

#[derive(Parser)]
#[command(name = "tenant-tls")]
#[command(author, version, about = "SNI certificate resolution for multi-tenant hosting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "tenant-tls.toml")]
    config: PathBuf,

    /// Log level, overrides `global.log_level`
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,
    /// Validate configuration and certificate files
    Validate,
}

fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Validate => validate_config(cli.config),
        Commands::Run => {
            let config = Config::load(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
            runtime.block_on(run_server(config, cli.config, cli.log_level))
        }
    }
}

async fn run_server(config: Config, config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let log_level = log_level.unwrap_or_else(|| config.global.log_level.clone());
    let telemetry_provider = telemetry::init_tracing(&log_level, &config.global.tracing)?;

    info!(config = ?config_path, "Starting tenant-tls");

    let domain = config.domain_config();
    info!(
        base_domain = %domain.base_domain(),
        host_mode = ?domain.host_mode(),
        "Tenancy configured"
    );

    let static_store = match config.static_cert_paths() {
        Some((cert, key)) => StaticCertificateStore::load(cert, key)?,
        None => {
            warn!("No static certificate configured, platform subdomains rely on ACME");
            StaticCertificateStore::empty()
        }
    };

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut background = Vec::new();
    let mut manager = CertificateManager::new(domain, static_store);

    if config.acme.enabled {
        let cache = open_cache(&config.cache).await.with_context(|| {
            format!("Failed to open {:?} certificate cache", config.cache.backend)
        })?;
        info!(
            backend = ?config.cache.backend,
            path = %config.cache.path,
            "Certificate cache ready"
        );

        let ca_url = resolve_acme_ca(&config.acme.ca);
        info!(provider = %get_acme_ca_name(&ca_url), url = %ca_url, "Using ACME CA");
        let authority = Arc::new(AcmeAuthority::new(
            ca_url,
            config.acme.email.clone(),
            config.acme.storage_path.clone(),
        ));

        let challenges = ChallengeTokens::new();
        let issuer = Arc::new(
            CertificateIssuer::new(cache, authority, challenges.clone())
                .with_renew_before_days(config.acme.renew_before_days),
        );

        let challenge_server = ChallengeServer::bind(
            &config.acme.challenge_listen,
            challenges,
            config.acme.redirect_to_https,
        )
        .await?;
        background.push(tokio::spawn(challenge_server.serve(shutdown_rx.clone())));

        background.push(
            RenewalScheduler::new(issuer.clone(), shutdown_rx.clone())
                .with_check_interval(config.acme.renewal_check_interval())
                .start(),
        );

        manager = manager.with_issuer(issuer, config.server.handshake_timeout());
    } else {
        info!("ACME disabled, custom domains will be rejected");
    }

    let listener = TlsListener::bind(&config.server.https_listen).await?;
    let tls_listener = Arc::new(
        TlsListener::new(Arc::new(manager))
            .with_alpn(config.server.alpn.as_slice())
            .with_client_hello_timeout(config.server.client_hello_timeout()),
    );
    let handler = Arc::new(ForwardHandler::new(config.server.upstream.clone()));

    ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        let _ = shutdown_tx.send(true);
    })
    .context("Failed to install shutdown signal handler")?;

    info!(upstream = %config.server.upstream, "tenant-tls started successfully");
    tls_listener.serve(listener, handler, shutdown_rx).await;

    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    telemetry::shutdown_telemetry(telemetry_provider);
    info!("Shutdown complete");
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let domain = config.domain_config();
    println!("Configuration is valid!");
    println!("  Base domain: {} ({:?} tenant)", domain.base_domain(), domain.host_mode());
    println!("  HTTPS listen: {}", config.server.https_listen);
    println!("  Upstream: {}", config.server.upstream);

    match config.static_cert_paths() {
        Some((cert, key)) => {
            let store = StaticCertificateStore::load(cert, key)?;
            if let Some(leaf) = store.certificate().map(|c| c.leaf()) {
                println!("  Static certificate: {:?}", leaf.dns_names);
                println!("    Expires: {}", leaf.not_after);
            }
        }
        None => println!("  Static certificate: none"),
    }

    if config.acme.enabled {
        let ca_url = resolve_acme_ca(&config.acme.ca);
        println!("  ACME: {} ({})", get_acme_ca_name(&ca_url), ca_url);
        println!("    Challenge listen: {}", config.acme.challenge_listen);
        println!("    Cache: {:?} at {}", config.cache.backend, config.cache.path);
    } else {
        println!("  ACME: disabled");
    }

    Ok(())
}
