//! Build pipeline
//!
//! One push event moves through these steps, each a precondition for the
//! next:
//!
//! 1. validate the event (repository identity, pusher allow-list)
//! 2. create or refresh the repository mirror
//! 3. look for the build script at the pushed commit
//! 4. check the commit out into `<mirror>/checkout/<short sha>`
//! 5. report `pending`
//! 6. run the build script, writing its output to the build log
//! 7. report `success` or `failure`
//!
//! Runs against the same repository are serialized; runs against different
//! repositories proceed concurrently.

use crate::command;
use crate::config::PipelineConfig;
use crate::event::{is_path_component, PushEvent};
use crate::git::{GitError, GitMirror};
use crate::status::{BuildState, BuildStatus, StatusReporter};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Environment variable carrying the full commit id to the build script
pub const ENV_SHA: &str = "HOOKRELAY_SHA";
/// Environment variable carrying the pushed ref to the build script
pub const ENV_REF: &str = "HOOKRELAY_REF";
/// Environment variable carrying the absolute build log path to the build script
pub const ENV_LOG: &str = "HOOKRELAY_LOG";

/// Errors that end a pipeline run early
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Empty repository name")]
    EmptyRepoName,
    #[error("Empty repository organization")]
    EmptyRepoOrganization,
    #[error("Repository {0:?} does not name a single directory")]
    InvalidRepository(String),
    #[error("User {0:?} not in the allowed set")]
    UserNotAllowed(String),
    #[error("Not a commit id: {0:?}")]
    InvalidCommit(String),
    #[error("Failed to update git mirror: {0}")]
    Mirror(#[source] GitError),
    #[error("Failed to look for the build script: {0}")]
    HookProbe(#[source] GitError),
    #[error("Failed to check out commit: {0}")]
    Checkout(#[source] GitError),
    #[error("Failed to open build log {}: {source}", path.display())]
    BuildLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Whether the event was refused before any side effect
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::EmptyRepoName
                | PipelineError::EmptyRepoOrganization
                | PipelineError::InvalidRepository(_)
                | PipelineError::UserNotAllowed(_)
                | PipelineError::InvalidCommit(_)
        )
    }
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The commit has no build script
    NoHook,
    /// The event asked for no build; the checkout exists but nothing ran
    Skipped,
    /// The build script exited zero
    Passed,
    /// The build script failed, with the reason reported upstream
    Failed(String),
}

impl std::fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildOutcome::NoHook => write!(f, "no build script"),
            BuildOutcome::Skipped => write!(f, "build skipped"),
            BuildOutcome::Passed => write!(f, "passed"),
            BuildOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Runs push events through mirror, checkout, build and reporting
pub struct Pipeline {
    config: PipelineConfig,
    public_url: String,
    mirror: GitMirror,
    reporter: StatusReporter,
    repo_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, public_url: impl Into<String>, reporter: StatusReporter) -> Self {
        let mirror = GitMirror::new(config.mirror_dir.clone(), config.fetch_timeout());
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            mirror,
            reporter,
            repo_locks: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// URL the statuses of `short_sha` link to
    pub fn log_url(&self, short_sha: &str) -> String {
        format!("{}/logs/{}/log.txt", self.public_url, short_sha)
    }

    /// On-disk location of the build log for `short_sha`
    pub fn log_path(&self, short_sha: &str) -> PathBuf {
        self.config.log_dir.join(short_sha).join("log.txt")
    }

    fn validate(&self, event: &PushEvent) -> Result<(), PipelineError> {
        if event.repository.name.is_empty() {
            return Err(PipelineError::EmptyRepoName);
        }
        if event.repository.organization.is_empty() {
            return Err(PipelineError::EmptyRepoOrganization);
        }
        let repo = &event.repository;
        if !is_path_component(&repo.organization) || !is_path_component(&repo.name) {
            return Err(PipelineError::InvalidRepository(repo.full_name()));
        }
        if !self.config.is_allowed(&event.pusher.name) {
            info!(pusher = %event.pusher.name, "Ignoring push, pusher not allowed");
            return Err(PipelineError::UserNotAllowed(event.pusher.name.clone()));
        }
        if event.after.is_empty() || !event.after.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::InvalidCommit(event.after.clone()));
        }
        Ok(())
    }

    fn repo_lock(&self, repo: &str) -> Arc<Mutex<()>> {
        self.repo_locks.entry(repo.to_string()).or_default().clone()
    }

    /// Run one push event to completion.
    ///
    /// A failing build is `Ok(BuildOutcome::Failed)`; `Err` means the run
    /// stopped before the build script could decide anything.
    pub async fn run(&self, event: &PushEvent) -> Result<BuildOutcome, PipelineError> {
        self.validate(event)?;

        let repo = event.repository.full_name();
        let sha = event.after.as_str();
        let short = event.short_sha();

        let lock = self.repo_lock(&repo);
        let _guard = lock.lock().await;

        info!(repo = %repo, git_ref = %event.git_ref, sha, url = %event.repository.url, "Push received");

        let mirror_dir = self
            .mirror
            .mirror_dir(&event.repository.organization, &event.repository.name);
        if let Err(e) = self.mirror.mirror(&event.repository.url, &mirror_dir).await {
            let err = PipelineError::Mirror(e);
            let status = BuildStatus::new(BuildState::Failure, self.public_url.clone(), err.to_string());
            self.reporter.report(&repo, sha, &status).await;
            return Err(err);
        }

        let present = self
            .mirror
            .has_file(&mirror_dir, sha, &self.config.hook_name)
            .await
            .map_err(PipelineError::HookProbe)?;
        if !present {
            info!(repo = %repo, sha, hook = %self.config.hook_name, "No build script, nothing to do");
            return Ok(BuildOutcome::NoHook);
        }

        let checkout_dir = mirror_dir.join("checkout").join(short);
        let work_tree = self
            .mirror
            .checkout(&mirror_dir, &checkout_dir, sha)
            .await
            .map_err(PipelineError::Checkout)?;
        info!(repo = %repo, dir = %work_tree.display(), "Created checkout");

        if event.side_channel.no_build {
            info!(repo = %repo, sha, "Build suppressed by event");
            return Ok(BuildOutcome::Skipped);
        }

        let (mut log, log_path) = self.create_log(short).await?;
        let log_url = self.log_url(short);

        let pending = BuildStatus::new(BuildState::Pending, log_url.clone(), "Running");
        self.reporter.report(&repo, sha, &pending).await;

        let (outcome, status) = match self.execute(event, &repo, &work_tree, &mut log, &log_path).await {
            Ok(()) => (
                BuildOutcome::Passed,
                BuildStatus::new(BuildState::Success, log_url, "Tests passed"),
            ),
            Err(reason) => (
                BuildOutcome::Failed(reason.clone()),
                BuildStatus::new(BuildState::Failure, log_url, reason),
            ),
        };
        self.reporter.report(&repo, sha, &status).await;

        info!(repo = %repo, sha, outcome = %outcome, "Pipeline finished");
        Ok(outcome)
    }

    /// Create (truncating) the build log, returning it with its absolute path.
    async fn create_log(&self, short_sha: &str) -> Result<(tokio::fs::File, PathBuf), PipelineError> {
        let path = self.log_path(short_sha);
        let path = std::path::absolute(&path).map_err(|source| PipelineError::BuildLog {
            path: path.clone(),
            source,
        })?;

        let io_err = |source| PipelineError::BuildLog {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = tokio::fs::File::create(&path).await.map_err(io_err)?;
        Ok((file, path))
    }

    async fn execute(
        &self,
        event: &PushEvent,
        repo: &str,
        work_tree: &Path,
        log: &mut tokio::fs::File,
        log_path: &Path,
    ) -> Result<(), String> {
        let header = format!(
            "repository: {}\nref: {}\ncommit: {}\ncheckout: {}\nstarted: {}\n\n",
            repo,
            event.git_ref,
            event.after,
            work_tree.display(),
            chrono::Utc::now().to_rfc3339(),
        );
        if let Err(e) = log.write_all(header.as_bytes()).await {
            warn!(log = %log_path.display(), error = %e, "Failed to write build log header");
        }

        let hook = work_tree.join(&self.config.hook_name);
        let mut cmd = command::command(work_tree, &hook.to_string_lossy(), Vec::<&str>::new());
        cmd.env(ENV_SHA, &event.after)
            .env(ENV_REF, &event.git_ref)
            .env(ENV_LOG, log_path);

        let start = Instant::now();
        let result = command::run_tee(&mut cmd, log, self.config.hook_timeout()).await;
        let elapsed = start.elapsed();

        let outcome = match result {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(status.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let mut footer = String::new();
        if let Err(reason) = &outcome {
            footer.push_str(&format!("\n{}\n", reason));
        }
        footer.push_str(&format!("Hook took {:?}\n", elapsed));
        if let Err(e) = async {
            log.write_all(footer.as_bytes()).await?;
            log.flush().await
        }
        .await
        {
            warn!(log = %log_path.display(), error = %e, "Failed to finish build log");
        }

        debug!(repo, sha = %event.after, elapsed_ms = elapsed.as_millis() as u64, "Build script finished");
        outcome
    }
}
