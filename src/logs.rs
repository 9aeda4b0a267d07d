//! Read-only access to build logs over HTTP

use crate::error::{json_error_response, RelayErrorCode};
use crate::event::is_path_component;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Route prefix for build logs
pub const LOGS_PREFIX: &str = "/logs/";

/// Map a request path below [`LOGS_PREFIX`] onto a file inside `log_dir`.
pub fn resolve(log_dir: &Path, request_path: &str) -> Option<PathBuf> {
    let rest = request_path.strip_prefix(LOGS_PREFIX)?;
    let mut path = log_dir.to_path_buf();
    for component in rest.split('/') {
        if !is_path_component(component) {
            return None;
        }
        path.push(component);
    }
    Some(path)
}

/// Serve the log file addressed by `request_path`, or 404.
pub async fn serve(log_dir: &Path, request_path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let not_found = || json_error_response(RelayErrorCode::NotFound, "No such log");

    let Some(path) = resolve(log_dir, request_path) else {
        return not_found();
    };

    match tokio::fs::read(&path).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(hyper::header::CACHE_CONTROL, "no-cache")
            .body(Full::new(Bytes::from(contents)).map_err(|e| match e {}).boxed())
            .expect("valid response builder"),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Log not readable");
            not_found()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_paths() {
        let base = Path::new("/srv/logs");
        assert_eq!(
            resolve(base, "/logs/ee7c7b/log.txt"),
            Some(PathBuf::from("/srv/logs/ee7c7b/log.txt"))
        );
        assert_eq!(resolve(base, "/logs/../secret"), None);
        assert_eq!(resolve(base, "/logs/ee7c7b/../../etc/passwd"), None);
        assert_eq!(resolve(base, "/logs/ee7c7b//log.txt"), None);
        assert_eq!(resolve(base, "/logs/"), None);
        assert_eq!(resolve(base, "/logs/a%2e%2e/log.txt"), None);
        assert_eq!(resolve(base, "/hook"), None);
    }

    #[tokio::test]
    async fn test_serve_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ee7c7b")).unwrap();
        std::fs::write(dir.path().join("ee7c7b/log.txt"), "building\n").unwrap();

        let resp = serve(dir.path(), "/logs/ee7c7b/log.txt").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"building\n");
    }

    #[tokio::test]
    async fn test_serve_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let resp = serve(dir.path(), "/logs/abcdef/log.txt").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // Directories are not listed
        std::fs::create_dir_all(dir.path().join("abcdef")).unwrap();
        let resp = serve(dir.path(), "/logs/abcdef").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
