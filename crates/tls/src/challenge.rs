//! HTTP-01 challenge tokens and the plain HTTP listener that serves them
//!
//! The CA fetches `http://{domain}/.well-known/acme-challenge/{token}` and
//! expects the key authorization registered by the issuer for that token.

use crate::error::TlsError;
use bytes::Bytes;
use dashmap::DashMap;
use http::{header, Method, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Shared map of pending challenge token → key authorization.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ChallengeTokens {
    inner: Arc<DashMap<String, String>>,
}

impl ChallengeTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token and return a guard that unregisters it on drop, so
    /// the token is cleared whether validation succeeds or fails
    pub fn register(&self, token: &str, key_authorization: &str) -> ChallengeGuard {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.inner
            .insert(token.to_string(), key_authorization.to_string());
        ChallengeGuard {
            tokens: self.clone(),
            token: token.to_string(),
        }
    }

    /// Key authorization for a pending token
    pub fn get(&self, token: &str) -> Option<String> {
        let result = self.inner.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    pub fn remove(&self, token: &str) {
        if self.inner.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.len()
    }
}

/// Removes its token from [`ChallengeTokens`] when dropped
#[derive(Debug)]
pub struct ChallengeGuard {
    tokens: ChallengeTokens,
    token: String,
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        self.tokens.remove(&self.token);
    }
}

/// Plain HTTP listener answering HTTP-01 challenges
pub struct ChallengeServer {
    listener: TcpListener,
    tokens: ChallengeTokens,
    redirect_to_https: bool,
}

impl ChallengeServer {
    /// Bind the listener. Failure here is fatal at startup.
    pub async fn bind(
        addr: &str,
        tokens: ChallengeTokens,
        redirect_to_https: bool,
    ) -> Result<Self, TlsError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| TlsError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!(address = %addr, "ACME challenge listener bound");
        Ok(Self {
            listener,
            tokens,
            redirect_to_https,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Challenge listener accept failed");
                            continue;
                        }
                    };

                    let tokens = self.tokens.clone();
                    let redirect = self.redirect_to_https;
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let response = respond(
                                req.method(),
                                req.uri(),
                                host_header(&req),
                                &tokens,
                                redirect,
                            );
                            async move { Ok::<_, Infallible>(response) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(peer = %peer, error = %e, "Challenge connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Challenge listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn host_header<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
}

/// Build the response for one plain HTTP request
pub fn respond(
    method: &Method,
    uri: &Uri,
    host: Option<&str>,
    tokens: &ChallengeTokens,
    redirect_to_https: bool,
) -> Response<Full<Bytes>> {
    if let Some(token) = uri.path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        if method != Method::GET {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        return match tokens.get(token) {
            Some(key_authorization) => {
                debug!(token = %token, "Responding to ACME challenge");
                plain(StatusCode::OK, key_authorization)
            }
            None => plain(StatusCode::NOT_FOUND, "not found"),
        };
    }

    if !redirect_to_https {
        return plain(StatusCode::NOT_FOUND, "not found");
    }

    if method != Method::GET && method != Method::HEAD {
        return plain(StatusCode::BAD_REQUEST, "use HTTPS");
    }

    let Some(host) = host.map(strip_port).filter(|h| !h.is_empty()) else {
        return plain(StatusCode::BAD_REQUEST, "missing host");
    };

    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", host, path_and_query);

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| plain(StatusCode::BAD_REQUEST, "bad request"))
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    response
}

/// Drop a `:port` suffix, keeping bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
