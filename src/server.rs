//! HTTP front end
//!
//! Requests whose host matches `<ref>.<repository>.<qa domain>` are proxied to
//! a preview backend. Everything else is routed by path: `/hook` to the
//! webhook handler and `/logs/...` to the build logs.

use crate::error::{json_error_response, RelayErrorCode};
use crate::forward::Forwarder;
use crate::logs;
use crate::router::{BackendKey, Router};
use crate::webhooks::WebhookHandler;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest webhook body accepted
const MAX_HOOK_BODY: usize = 25 * 1024 * 1024;

/// Route for push notifications
pub const HOOK_PATH: &str = "/hook";

/// Preview routing: a domain suffix and the router owning the backends
pub struct Previews {
    pub domain: String,
    pub router: Router,
}

/// Everything a request handler needs
pub struct AppState {
    pub webhook: WebhookHandler,
    pub previews: Option<Previews>,
    pub forwarder: Forwarder,
    pub log_dir: PathBuf,
    pub request_timeout: Duration,
}

/// Accept loop serving [`AppState`] on a shared listener
pub struct RelayServer {
    listener: Arc<TcpListener>,
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayServer {
    /// The listener is shared so it can outlive the server for a handoff.
    pub fn new(listener: Arc<TcpListener>, state: Arc<AppState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listener,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Relay server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    state: Arc<AppState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(hostname) = extract_hostname(&req) else {
        return Ok(json_error_response(
            RelayErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), "Incoming request");

    if let Some(ref previews) = state.previews {
        if let Some(key) = BackendKey::from_host(&hostname, &previews.domain) {
            return Ok(proxy_preview(req, key, &previews.router, &state, client_addr).await);
        }
    }

    let path = req.uri().path().to_string();
    if path == HOOK_PATH {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, MAX_HOOK_BODY).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read webhook body");
                return Ok(json_error_response(
                    RelayErrorCode::InvalidPayload,
                    "Unable to read request body",
                ));
            }
        };
        return Ok(state.webhook.handle(&parts.method, &parts.headers, body).await);
    }

    if path.starts_with(logs::LOGS_PREFIX) {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Ok(json_error_response(RelayErrorCode::MethodNotAllowed, "Logs are read-only"));
        }
        return Ok(logs::serve(&state.log_dir, &path).await);
    }

    Ok(json_error_response(RelayErrorCode::NotFound, "Not found"))
}

async fn proxy_preview(
    req: Request<Incoming>,
    key: BackendKey,
    router: &Router,
    state: &AppState,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let backend = match router.resolve(key.clone()).await {
        Ok(backend) => backend,
        Err(e) => {
            error!(key = %key, error = %e, "Failed to resolve backend");
            return json_error_response(RelayErrorCode::InternalError, e.to_string());
        }
    };

    let port = match backend.ready().await {
        Ok(port) => port,
        Err(e) => {
            error!(key = %key, error = %e, "Backend unavailable");
            return json_error_response(RelayErrorCode::BackendStartFailed, e.to_string());
        }
    };

    match tokio::time::timeout(state.request_timeout, state.forwarder.forward(req, port, client_addr.ip())).await {
        Ok(Ok((request_id, response))) => {
            debug!(key = %key, port, request_id, status = %response.status(), "Backend responded");
            response
        }
        Ok(Err(e)) => {
            error!(key = %key, port, error = %e, "Failed to forward request");
            json_error_response(RelayErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        Err(_) => {
            warn!(key = %key, port, timeout_secs = state.request_timeout.as_secs(), "Request timed out");
            json_error_response(
                RelayErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", state.request_timeout.as_secs()),
            )
        }
    }
}

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;
    parse_hostname(raw)
}

/// Lowercased host without port, or `None` if it is not a plausible DNS name.
fn parse_hostname(raw: &str) -> Option<String> {
    let hostname = raw.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; keeps log lines clean
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.to_lowercase())
}
