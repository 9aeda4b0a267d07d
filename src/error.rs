//! Error and plain responses for the HTTP surface
//!
//! Every failure the relay answers itself carries a JSON body and the code in
//! the `X-Relay-Error` header, so clients can tell relay errors apart from
//! responses produced by a preview backend.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_RELAY_ERROR: &str = "x-relay-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayErrorCode {
    MissingHostHeader,
    NotFound,
    MethodNotAllowed,
    /// Body unreadable or not JSON
    InvalidPayload,
    /// Zero or several event type headers
    MissingEventHeader,
    InvalidSignature,
    /// The pipeline refused or aborted a synchronously handled event
    EventFailed,
    BackendStartFailed,
    RequestTimeout,
    ConnectionFailed,
    InternalError,
}

impl RelayErrorCode {
    fn describe(self) -> (StatusCode, &'static str) {
        use RelayErrorCode::*;
        match self {
            MissingHostHeader => (StatusCode::BAD_REQUEST, "MISSING_HOST_HEADER"),
            NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED"),
            InvalidPayload => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
            MissingEventHeader => (StatusCode::BAD_REQUEST, "MISSING_EVENT_HEADER"),
            InvalidSignature => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE"),
            EventFailed => (StatusCode::BAD_REQUEST, "EVENT_FAILED"),
            BackendStartFailed => (StatusCode::INTERNAL_SERVER_ERROR, "BACKEND_START_FAILED"),
            RequestTimeout => (StatusCode::GATEWAY_TIMEOUT, "REQUEST_TIMEOUT"),
            ConnectionFailed => (StatusCode::BAD_GATEWAY, "CONNECTION_FAILED"),
            InternalError => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    pub fn status_code(self) -> StatusCode {
        self.describe().0
    }

    /// Value sent in the `X-Relay-Error` header
    pub fn as_header_value(self) -> &'static str {
        self.describe().1
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: RelayErrorCode,
    message: &'a str,
    status: u16,
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

/// JSON error body with the matching status and `X-Relay-Error` header.
pub fn json_error_response(code: RelayErrorCode, message: impl AsRef<str>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (status, header) = code.describe();
    let body = ErrorBody {
        code,
        message: message.as_ref(),
        status: status.as_u16(),
    };
    let json = serde_json::to_vec(&body).unwrap_or_default();

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(X_RELAY_ERROR, header)
        .body(full(json))
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body))
        .expect("valid response with StatusCode enum and static headers")
}
