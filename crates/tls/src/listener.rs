//! SNI-driven TLS listener
//!
//! Reads the ClientHello before choosing a certificate, so resolution can be
//! asynchronous (cache lookups, ACME issuance). Each connection gets a
//! `ServerConfig` holding exactly the resolved certificate; rejected
//! handshakes get a resolver with no certificate and fail with a generic
//! alert.

use crate::error::{TlsError, ValidationError};
use crate::manager::{CertificateManager, RejectReason, Resolution};
use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

/// Default bound on reading the ClientHello and finishing the handshake
pub const DEFAULT_CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a single connection did not produce a TLS stream
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("client did not complete the handshake within {0:?}")]
    Timeout(Duration),

    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),
}

/// Receives every established TLS connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TlsStream<TcpStream>, peer: SocketAddr, server_name: String);
}

/// Relays decrypted traffic to a plaintext upstream
pub struct ForwardHandler {
    upstream: String,
}

impl ForwardHandler {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for ForwardHandler {
    async fn handle(
        &self,
        mut stream: TlsStream<TcpStream>,
        peer: SocketAddr,
        server_name: String,
    ) {
        let mut upstream = match TcpStream::connect(&self.upstream).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!(upstream = %self.upstream, error = %e, "Failed to connect to upstream");
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
            Ok((to_upstream, to_client)) => debug!(
                peer = %peer,
                server_name = %server_name,
                to_upstream,
                to_client,
                "Connection closed"
            ),
            Err(e) => debug!(peer = %peer, server_name = %server_name, error = %e, "Relay ended"),
        }
    }
}

/// Presents one pre-resolved certificate
#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Presents nothing, so rustls aborts with `handshake_failure`
#[derive(Debug)]
struct RejectingResolver;

impl ResolvesServerCert for RejectingResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// TLS front door backed by a [`CertificateManager`]
pub struct TlsListener {
    manager: Arc<CertificateManager>,
    provider: Arc<CryptoProvider>,
    alpn_protocols: Vec<Vec<u8>>,
    client_hello_timeout: Duration,
}

impl TlsListener {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self {
            manager,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            alpn_protocols: Vec::new(),
            client_hello_timeout: DEFAULT_CLIENT_HELLO_TIMEOUT,
        }
    }

    /// Protocols to offer via ALPN, in preference order
    pub fn with_alpn<S: AsRef<str>>(mut self, protocols: &[S]) -> Self {
        self.alpn_protocols = protocols
            .iter()
            .map(|p| p.as_ref().as_bytes().to_vec())
            .collect();
        self
    }

    pub fn with_client_hello_timeout(mut self, timeout: Duration) -> Self {
        self.client_hello_timeout = timeout;
        self
    }

    /// Bind the HTTPS address
    pub async fn bind(addr: &str) -> Result<TcpListener, TlsError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| TlsError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!(address = %addr, "TLS listener bound");
        Ok(listener)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn serve<H: ConnectionHandler>(
        self: Arc<Self>,
        listener: TcpListener,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "TLS listener accept failed");
                            continue;
                        }
                    };

                    let this = self.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        match this.accept(stream).await {
                            Ok((tls, server_name)) => handler.handle(tls, peer, server_name).await,
                            Err(HandshakeError::Rejected(reason)) => {
                                debug!(peer = %peer, reason = %reason, "TLS handshake refused");
                            }
                            Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("TLS listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one server handshake, resolving the certificate from SNI
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, String), HandshakeError> {
        let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
        let start = tokio::time::timeout(self.client_hello_timeout, acceptor)
            .await
            .map_err(|_| HandshakeError::Timeout(self.client_hello_timeout))??;

        let server_name = start.client_hello().server_name().map(str::to_string);
        let resolution = match &server_name {
            Some(name) => self.manager.resolve(name).await,
            None => Resolution::Rejected(RejectReason::Invalid(ValidationError::Empty)),
        };

        match (resolution, server_name) {
            (Resolution::Resolved { certificate, .. }, Some(name)) => {
                let config = self.server_config(Arc::new(SingleCertResolver(certificate)))?;
                let tls = tokio::time::timeout(self.client_hello_timeout, start.into_stream(config))
                    .await
                    .map_err(|_| HandshakeError::Timeout(self.client_hello_timeout))??;
                Ok((tls, name))
            }
            (Resolution::Rejected(reason), _) => {
                let config = self.server_config(Arc::new(RejectingResolver))?;
                if let Err(e) = start.into_stream(config).await {
                    debug!(error = %e, "Sent handshake failure alert");
                }
                Err(HandshakeError::Rejected(reason))
            }
            (Resolution::Resolved { .. }, None) => {
                warn!("Resolved a certificate without a server name");
                Err(HandshakeError::Rejected(RejectReason::Invalid(
                    ValidationError::Empty,
                )))
            }
        }
    }

    fn server_config(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<Arc<ServerConfig>, rustls::Error> {
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&version::TLS12, &version::TLS13])?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }
}
