//! Commit status reporting to the origin host
//!
//! Statuses are posted to `<api_url>/repos/<org>/<repo>/statuses/<sha>`. The
//! reporter never fails the caller: [`StatusReporter::report`] logs problems and
//! moves on, so a build's outcome does not depend on the status API being up.

use crate::config::GithubConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response status the origin host uses for a hook that already exists.
const HOOK_ALREADY_EXISTS: StatusCode = StatusCode::UNPROCESSABLE_ENTITY;

/// Event kinds a registered hook subscribes to
const HOOK_EVENTS: &[&str] = &[
    "push",
    "issues",
    "issue_comment",
    "commit_comment",
    "create",
    "delete",
    "pull_request",
    "pull_request_review_comment",
    "gollum",
    "watch",
    "release",
    "fork",
    "member",
    "public",
    "team_add",
    "status",
];

/// Build state as understood by the status API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Pending,
    Success,
    Failure,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Success => "success",
            BuildState::Failure => "failure",
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub state: BuildState,
    pub target_url: String,
    pub description: String,
}

impl BuildStatus {
    pub fn new(state: BuildState, target_url: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            state,
            target_url: target_url.into(),
            description: description.into(),
        }
    }
}

/// Errors from the status API
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// The call was deliberately not made (test mode or no credentials)
    #[error("status endpoint skipped: {0}")]
    Skipped(&'static str),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}: {body}")]
    Rejected {
        url: String,
        status: StatusCode,
        body: String,
    },
}

/// Result of registering a push hook on one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRegistration {
    Created,
    AlreadyHooked,
}

/// Client for the origin host's REST API
pub struct StatusReporter {
    http_client: reqwest::Client,
    api_url: String,
    user: Option<String>,
    password: Option<String>,
    context: String,
    test_mode: bool,
}

impl StatusReporter {
    pub fn new(config: &GithubConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            user: config.user.clone().filter(|u| !u.is_empty()),
            password: config.password.clone(),
            context: config.context.clone(),
            test_mode: config.test_mode,
        })
    }

    /// Whether network calls are suppressed
    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    fn endpoint(&self, parts: &[&str]) -> String {
        format!("{}/{}", self.api_url, parts.join("/"))
    }

    /// POST `payload` to the endpoint made of `parts`.
    async fn post(&self, parts: &[&str], payload: &serde_json::Value) -> Result<(StatusCode, String), StatusError> {
        if self.test_mode {
            return Err(StatusError::Skipped("test mode"));
        }
        let Some(user) = self.user.as_deref() else {
            debug!(endpoint = ?parts, "No API user configured, not querying endpoint");
            return Err(StatusError::Skipped("no credentials"));
        };

        let url = self.endpoint(parts);
        debug!(url = %url, "Querying");

        let response = self
            .http_client
            .post(&url)
            .basic_auth(user, self.password.as_deref())
            .header("Accept", "application/vnd.github.v3+json")
            .json(payload)
            .send()
            .await
            .map_err(|source| StatusError::Transport { url: url.clone(), source })?;

        if let Some(remaining) = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
        {
            debug!(remaining, "Rate limit");
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }

    /// Post a commit status, returning an error for any failure.
    pub async fn post_status(&self, repo: &str, sha: &str, status: &BuildStatus) -> Result<(), StatusError> {
        let payload = serde_json::json!({
            "state": status.state,
            "target_url": status.target_url,
            "description": status.description,
            "context": self.context,
        });

        let (code, body) = self.post(&["repos", repo, "statuses", sha], &payload).await?;
        if !code.is_success() {
            return Err(StatusError::Rejected {
                url: self.endpoint(&["repos", repo, "statuses", sha]),
                status: code,
                body,
            });
        }

        info!(repo, sha, state = %status.state, "Commit status updated");
        Ok(())
    }

    /// Post a commit status, logging rather than returning failures.
    pub async fn report(&self, repo: &str, sha: &str, status: &BuildStatus) {
        match self.post_status(repo, sha, status).await {
            Ok(()) => {}
            Err(StatusError::Skipped(reason)) => {
                debug!(repo, sha, state = %status.state, reason, "Status report skipped");
            }
            Err(e) => {
                warn!(repo, sha, state = %status.state, error = %e, "Failed to update commit status");
            }
        }
    }

    /// Register a JSON web hook pointing at `hook_url` on `repo`.
    pub async fn register_hook(&self, repo: &str, hook_url: &str) -> Result<HookRegistration, StatusError> {
        let payload = serde_json::json!({
            "name": "web",
            "config": {"url": hook_url, "content_type": "json"},
            "events": HOOK_EVENTS,
            "active": true,
        });

        let (code, body) = self.post(&["repos", repo, "hooks"], &payload).await?;
        if code == HOOK_ALREADY_EXISTS {
            info!(repo, "Already hooked");
            return Ok(HookRegistration::AlreadyHooked);
        }
        if !code.is_success() {
            return Err(StatusError::Rejected {
                url: self.endpoint(&["repos", repo, "hooks"]),
                status: code,
                body,
            });
        }

        info!(repo, hook_url, "Registered push hook");
        Ok(HookRegistration::Created)
    }

    /// Register hooks on every repository, logging each result.
    pub async fn register_hooks(&self, repositories: &[String], hook_url: &str) {
        for repo in repositories {
            match self.register_hook(repo, hook_url).await {
                Ok(_) => {}
                Err(StatusError::Skipped(reason)) => {
                    debug!(repo = %repo, reason, "Hook registration skipped");
                }
                Err(e) => warn!(repo = %repo, error = %e, "Failed to register hook"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(test_mode: bool, user: Option<&str>) -> GithubConfig {
        GithubConfig {
            test_mode,
            user: user.map(String::from),
            password: Some("secret".to_string()),
            ..GithubConfig::default()
        }
    }

    #[test]
    fn test_build_state_serializes_lowercase() {
        let status = BuildStatus::new(BuildState::Pending, "http://x/logs/abc/log.txt", "Running");
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"pending\""));
        assert!(json.contains("\"target_url\":\"http://x/logs/abc/log.txt\""));
        assert_eq!(BuildState::Failure.to_string(), "failure");
    }

    #[tokio::test]
    async fn test_test_mode_skips_network() {
        let reporter = StatusReporter::new(&config(true, Some("bot"))).unwrap();
        assert!(reporter.is_test_mode());

        let status = BuildStatus::new(BuildState::Success, "http://x", "Tests passed");
        let err = reporter.post_status("example/tang", "ee7c7b8", &status).await.unwrap_err();
        assert!(matches!(err, StatusError::Skipped("test mode")));

        // report() swallows the skip
        reporter.report("example/tang", "ee7c7b8", &status).await;
    }

    #[tokio::test]
    async fn test_missing_user_skips_network() {
        let reporter = StatusReporter::new(&config(false, None)).unwrap();
        let status = BuildStatus::new(BuildState::Pending, "http://x", "Running");
        let err = reporter.post_status("example/tang", "ee7c7b8", &status).await.unwrap_err();
        assert!(matches!(err, StatusError::Skipped("no credentials")));
    }

    #[test]
    fn test_endpoint_joins_parts() {
        let mut cfg = config(true, None);
        cfg.api_url = "http://127.0.0.1:1234/".to_string();
        let reporter = StatusReporter::new(&cfg).unwrap();
        assert_eq!(
            reporter.endpoint(&["repos", "example/tang", "statuses", "abc"]),
            "http://127.0.0.1:1234/repos/example/tang/statuses/abc"
        );
    }
}
