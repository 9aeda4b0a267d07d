//! Forwarding of preview requests to a local backend port

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and must not be relayed
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("backend unreachable: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("cannot address backend: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),
}

/// Idle connection retention towards backends
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub max_idle_per_backend: usize,
    pub idle_timeout: Duration,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            max_idle_per_backend: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&crate::config::ServerConfig> for ForwardSettings {
    fn from(config: &crate::config::ServerConfig) -> Self {
        Self {
            max_idle_per_backend: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }
    }
}

/// Relays requests to backends on the loopback interface over pooled
/// connections
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
}

impl Forwarder {
    pub fn new(settings: &ForwardSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.max_idle_per_backend)
            .pool_idle_timeout(settings.idle_timeout)
            .build(connector);

        Self { client }
    }

    /// Send `req` to `127.0.0.1:port`, keeping method, path, query and body.
    ///
    /// The request is stamped with a request id and `X-Forwarded-*` headers
    /// naming `client`. Returns the id together with the backend's response.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
        client: IpAddr,
    ) -> Result<(String, Response<BoxBody<Bytes, hyper::Error>>), ForwardError> {
        let (mut parts, body) = req.into_parts();

        let target = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        parts.uri = format!("http://127.0.0.1:{}{}", port, target).parse::<Uri>()?;

        let request_id = stamp(&mut parts.headers, client);
        debug!(port, request_id, uri = %parts.uri, "Forwarding");

        let response = self.client.request(Request::from_parts(parts, body)).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok((request_id, Response::from_parts(parts, body.boxed())))
    }
}

/// Prepare inbound headers for the backend, returning the request id.
///
/// `X-Forwarded-*` values are replaced, not appended: the relay is the first
/// hop that can be trusted.
fn stamp(headers: &mut HeaderMap, client: IpAddr) -> String {
    strip_hop_by_hop(headers);

    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client.to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

/// Remove the fixed hop-by-hop set plus anything the `Connection` header lists.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
