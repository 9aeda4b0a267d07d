//! Push notification endpoint
//!
//! `POST /hook` receives event documents from the origin host. Push events
//! are handed to the [`Pipeline`] in the background, or inline when the
//! document's side channel asks to wait.

use crate::error::{json_error_response, text_response, RelayErrorCode};
use crate::event::{PushEvent, SideChannel};
use crate::pipeline::{BuildOutcome, Pipeline, PipelineError};
use anyhow::Context;
use hmac::{Hmac, Mac};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Response, StatusCode};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header naming the event type
pub const EVENT_HEADER: &str = "x-github-event";
/// Header carrying `sha256=<hex>` of the body
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Errors from handling one event document
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid push event: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Dispatch an event document by type.
///
/// Returns `None` for events that were accepted but needed no build.
pub async fn handle_event(
    pipeline: &Pipeline,
    event_type: &str,
    document: &[u8],
) -> Result<Option<BuildOutcome>, EventError> {
    match event_type {
        "push" => {
            let event = PushEvent::from_slice(document)?;
            debug!(?event, "Received push event");

            if event.deleted {
                info!(git_ref = %event.git_ref, repo = %event.repository.full_name(), "Ref deleted, ignoring push");
                return Ok(None);
            }

            Ok(Some(pipeline.run(&event).await?))
        }
        other => {
            info!(event = other, "Unhandled event");
            Ok(None)
        }
    }
}

/// Handles requests to the webhook route
pub struct WebhookHandler {
    pipeline: Arc<Pipeline>,
    secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(pipeline: Arc<Pipeline>, secret: Option<String>) -> Self {
        Self {
            pipeline,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub async fn handle(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if method != Method::POST {
            return json_error_response(RelayErrorCode::MethodNotAllowed, "Expected JSON POST payload");
        }

        if let Some(ref secret) = self.secret {
            let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
            if !verify_signature(secret, &body, signature) {
                return json_error_response(RelayErrorCode::InvalidSignature, "Invalid webhook signature");
            }
        }

        if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
            info!(error = %e, "Not a valid JSON payload, ignoring");
            return json_error_response(
                RelayErrorCode::InvalidPayload,
                format!("Expected valid JSON POST payload: {}", e),
            );
        }

        let mut event_types = headers.get_all(EVENT_HEADER).iter();
        let event_type = match (event_types.next(), event_types.next()) {
            (Some(value), None) => match value.to_str() {
                Ok(v) => v.to_string(),
                Err(_) => {
                    return json_error_response(RelayErrorCode::MissingEventHeader, "Unreadable X-Github-Event header")
                }
            },
            _ => {
                info!("No single X-Github-Event header, ignoring");
                return json_error_response(RelayErrorCode::MissingEventHeader, "Expected X-Github-Event header");
            }
        };

        if !SideChannel::peek(&body).wait {
            let pipeline = Arc::clone(&self.pipeline);
            tokio::spawn(async move {
                match handle_event(&pipeline, &event_type, &body).await {
                    Ok(Some(outcome)) => debug!(event = %event_type, outcome = %outcome, "Event handled"),
                    Ok(None) => {}
                    Err(EventError::Pipeline(e)) if e.is_validation() => {
                        warn!(event = %event_type, error = %e, "Event refused");
                    }
                    Err(e) => error!(event = %event_type, error = %e, "Error processing event"),
                }
            });
            return text_response(StatusCode::OK, "OK. Not waiting for build.\n");
        }

        match handle_event(&self.pipeline, &event_type, &body).await {
            Ok(Some(outcome)) => text_response(StatusCode::OK, format!("OK: {}\n", outcome)),
            Ok(None) => text_response(StatusCode::OK, "OK\n"),
            Err(e) => {
                warn!(event = %event_type, error = %e, "Error handling event");
                json_error_response(RelayErrorCode::EventFailed, format!("Error handling event: {}", e))
            }
        }
    }
}

/// Check `signature` (`sha256=<hex>`) against the HMAC of `payload`.
pub fn verify_signature(secret: &str, payload: &[u8], signature: Option<&str>) -> bool {
    let Some(provided) = signature.and_then(|s| s.strip_prefix("sha256=")) else {
        warn!("Missing or malformed webhook signature");
        return false;
    };

    match verify_hmac_sha256(secret, payload, provided) {
        Ok(true) => true,
        Ok(false) => {
            warn!("Webhook signature verification failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "Webhook signature verification error");
            false
        }
    }
}

fn verify_hmac_sha256(secret: &str, payload: &[u8], signature_hex: &str) -> anyhow::Result<bool> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("Invalid HMAC key")?;
    mac.update(payload);
    let expected_hex = hex::encode(mac.finalize().into_bytes());
    Ok(constant_time_compare(&expected_hex, &signature_hex.to_ascii_lowercase()))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GithubConfig, PipelineConfig};
    use crate::status::StatusReporter;
    use hyper::header::HeaderValue;

    fn handler(secret: Option<&str>) -> (WebhookHandler, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            mirror_dir: root.path().join("repo"),
            log_dir: root.path().join("logs"),
            ..PipelineConfig::default()
        }
        .allow("testuser");
        let reporter = StatusReporter::new(&GithubConfig {
            test_mode: true,
            ..GithubConfig::default()
        })
        .unwrap();
        let pipeline = Arc::new(Pipeline::new(config, "http://localhost:8080", reporter));
        (WebhookHandler::new(pipeline, secret.map(String::from)), root)
    }

    fn headers(event: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(event) = event {
            headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
        }
        headers
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"zen": "Design for failure."}"#;
        let good = sign("s3cret", body);

        assert!(verify_signature("s3cret", body, Some(&good)));
        assert!(verify_signature("s3cret", body, Some(&good.to_uppercase().replace("SHA256=", "sha256="))));
        assert!(!verify_signature("other", body, Some(&good)));
        assert!(!verify_signature("s3cret", b"tampered", Some(&good)));
        assert!(!verify_signature("s3cret", body, None));
        assert!(!verify_signature("s3cret", body, Some("sha1=abc")));
    }

    #[tokio::test]
    async fn test_rejects_non_post() {
        let (handler, _root) = handler(None);
        let resp = handler.handle(&Method::GET, &headers(Some("push")), Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_rejects_invalid_json() {
        let (handler, _root) = handler(None);
        let resp = handler
            .handle(&Method::POST, &headers(Some("push")), Bytes::from_static(b"{not json"))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("x-relay-error").unwrap(), "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn test_rejects_missing_event_header() {
        let (handler, _root) = handler(None);
        let resp = handler
            .handle(&Method::POST, &headers(None), Bytes::from_static(b"{}"))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("x-relay-error").unwrap(), "MISSING_EVENT_HEADER");
    }

    #[tokio::test]
    async fn test_rejects_bad_signature() {
        let (handler, _root) = handler(Some("s3cret"));
        let mut hdrs = headers(Some("ping"));
        hdrs.insert(SIGNATURE_HEADER, HeaderValue::from_static("sha256=00"));
        let resp = handler.handle(&Method::POST, &hdrs, Bytes::from_static(b"{}")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = Bytes::from_static(br#"{"nongithub": {"wait": true}}"#);
        let mut hdrs = headers(Some("ping"));
        hdrs.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sign("s3cret", &body)).unwrap());
        let resp = handler.handle(&Method::POST, &hdrs, body).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_events_acknowledged() {
        let (handler, _root) = handler(None);
        let resp = handler
            .handle(
                &Method::POST,
                &headers(Some("issues")),
                Bytes::from_static(br#"{"action": "opened", "nongithub": {"wait": true}}"#),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deleted_ref_ignored() {
        let (handler, root) = handler(None);
        let body = br#"{
            "ref": "refs/heads/gone", "after": "0000000000000000000000000000000000000000", "deleted": true,
            "repository": {"name": "tang", "organization": "example", "url": "/nowhere"},
            "pusher": {"name": "testuser"},
            "nongithub": {"wait": true}
        }"#;
        let resp = handler
            .handle(&Method::POST, &headers(Some("push")), Bytes::from_static(body))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!root.path().join("repo").exists());
    }

    #[tokio::test]
    async fn test_wait_mode_surfaces_pipeline_error() {
        let (handler, _root) = handler(None);
        let body = br#"{
            "ref": "refs/heads/master", "after": "ee7c7b8d1b0e0e4c1a5b8d8b0f2c1e0a9b8c7d6e",
            "repository": {"name": "tang", "organization": "example", "url": "/nowhere"},
            "pusher": {"name": "testeviluser"},
            "nongithub": {"wait": true}
        }"#;
        let resp = handler
            .handle(&Method::POST, &headers(Some("push")), Bytes::from_static(body))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("x-relay-error").unwrap(), "EVENT_FAILED");
    }

    #[tokio::test]
    async fn test_background_mode_answers_immediately() {
        let (handler, _root) = handler(None);
        let body = br#"{
            "ref": "refs/heads/master", "after": "ee7c7b8d1b0e0e4c1a5b8d8b0f2c1e0a9b8c7d6e",
            "repository": {"name": "tang", "organization": "example", "url": "/nowhere"},
            "pusher": {"name": "testeviluser"}
        }"#;
        let resp = handler
            .handle(&Method::POST, &headers(Some("push")), Bytes::from_static(body))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
    }
}
