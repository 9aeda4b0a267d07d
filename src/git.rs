//! Local git mirrors and checkouts
//!
//! Each watched repository has one bare mirror on disk. Builds never touch the
//! origin directly: the mirror is refreshed, then the requested commit is
//! materialized into a throwaway working tree.

use crate::command::{self, CommandError};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Exit status `git fetch` uses when there was nothing to fetch.
const FETCH_NOTHING_TO_DO: i32 = 1;

/// Exit statuses `git cat-file -e` uses for a missing commit or path.
const OBJECT_MISSING: [i32; 2] = [1, 128];

/// Marker git prints when the directory it was pointed at holds no repository
const NOT_A_REPOSITORY: &str = "not a git repository";

/// Errors raised by git operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("git {operation} exited with status {code:?}: {stderr}")]
    Failed {
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        GitError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What [`GitMirror::mirror`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorUpdate {
    /// The mirror did not exist and was cloned
    Cloned,
    /// The mirror existed and was fetched (possibly with nothing new)
    Fetched,
}

/// Manages bare mirrors below a base directory
#[derive(Debug, Clone)]
pub struct GitMirror {
    base_dir: PathBuf,
    fetch_timeout: Duration,
}

impl GitMirror {
    pub fn new(base_dir: impl Into<PathBuf>, fetch_timeout: Duration) -> Self {
        Self {
            base_dir: base_dir.into(),
            fetch_timeout,
        }
    }

    /// Directory holding the mirror for `organization/name`
    pub fn mirror_dir(&self, organization: &str, name: &str) -> PathBuf {
        self.base_dir.join(organization).join(name)
    }

    /// Create the mirror of `url` at `mirror_dir`, or refresh it if present.
    ///
    /// A refresh is bounded by the fetch timeout; when it expires the fetch is
    /// killed and a timeout error is returned.
    pub async fn mirror(&self, url: &str, mirror_dir: &Path) -> Result<MirrorUpdate, GitError> {
        if !mirror_dir.exists() {
            let parent = mirror_dir.parent().unwrap_or(Path::new("."));
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GitError::io(parent, e))?;

            let mut cmd = command::command(
                Path::new("."),
                "git",
                [
                    OsStr::new("clone"),
                    OsStr::new("-q"),
                    OsStr::new("--mirror"),
                    OsStr::new(url),
                    mirror_dir.as_os_str(),
                ],
            );
            let output = command::run(&mut cmd).await?;
            if !output.status.success() {
                return Err(GitError::Failed {
                    operation: "clone",
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }

            info!(url, dir = %mirror_dir.display(), "Cloned mirror");
            return Ok(MirrorUpdate::Cloned);
        }

        let mut cmd = command::command(mirror_dir, "git", ["fetch", "-q"]);
        cmd.env("GIT_TRACE", "1");
        let finished = command::run_with_timeout(&mut cmd, self.fetch_timeout).await?;

        match finished.status.code() {
            Some(0) | Some(FETCH_NOTHING_TO_DO) => {
                info!(url, dir = %mirror_dir.display(), "Mirror updated");
                Ok(MirrorUpdate::Fetched)
            }
            code => Err(GitError::Failed {
                operation: "fetch",
                code,
                stderr: without_trace(&finished.stderr),
            }),
        }
    }

    /// Whether `relative_path` exists in the tree of `commit`.
    ///
    /// A missing commit or path is `Ok(false)`; anything else that goes wrong
    /// is an error.
    pub async fn has_file(&self, mirror_dir: &Path, commit: &str, relative_path: &str) -> Result<bool, GitError> {
        let object = format!("{}:{}", commit, relative_path);
        let mut cmd = command::command(mirror_dir, "git", ["cat-file", "-e", object.as_str()]);
        // No discovery: a directory that is not a repository must fail here
        // instead of resolving to an enclosing one.
        cmd.env("GIT_DIR", ".");
        let output = command::run(&mut cmd).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => Ok(true),
            Some(code) if OBJECT_MISSING.contains(&code) && !stderr.contains(NOT_A_REPOSITORY) => {
                debug!(commit, path = relative_path, "File not present at commit");
                Ok(false)
            }
            code => Err(GitError::Failed {
                operation: "cat-file",
                code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }

    /// Populate `checkout_dir` with the full tree at `commit`, returning its
    /// canonical path.
    ///
    /// Anything already in `checkout_dir` is removed first.
    pub async fn checkout(&self, mirror_dir: &Path, checkout_dir: &Path, commit: &str) -> Result<PathBuf, GitError> {
        match tokio::fs::remove_dir_all(checkout_dir).await {
            Ok(()) => debug!(dir = %checkout_dir.display(), "Removed previous checkout"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GitError::io(checkout_dir, e)),
        }
        tokio::fs::create_dir_all(checkout_dir)
            .await
            .map_err(|e| GitError::io(checkout_dir, e))?;
        let work_tree = tokio::fs::canonicalize(checkout_dir)
            .await
            .map_err(|e| GitError::io(checkout_dir, e))?;

        info!(dir = %work_tree.display(), commit, "Populating checkout");

        let mut cmd = command::command(
            mirror_dir,
            "git",
            [
                OsStr::new("--work-tree"),
                work_tree.as_os_str(),
                OsStr::new("checkout"),
                OsStr::new("-f"),
                OsStr::new(commit),
                OsStr::new("--"),
                OsStr::new("."),
            ],
        );
        let output = command::run(&mut cmd).await?;
        if !output.status.success() {
            return Err(GitError::Failed {
                operation: "checkout",
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(work_tree)
    }
}

/// stderr of a traced git command with the `GIT_TRACE` lines dropped
fn without_trace(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.contains(" trace: "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Install a credential helper reading `GITHUB_USER`/`GITHUB_PASSWORD` unless
/// one is already configured globally.
pub async fn ensure_credential_helper() -> Result<bool, GitError> {
    let mut cmd = command::command(Path::new("."), "git", ["config", "--global", "--get", "credential.helper"]);
    let output = command::run(&mut cmd).await?;

    match output.status.code() {
        Some(0) => Ok(false),
        Some(1) => {
            let helper = "!f() { echo username=$GITHUB_USER; echo password=$GITHUB_PASSWORD; }; f";
            let mut cmd = command::command(
                Path::new("."),
                "git",
                ["config", "--global", "credential.helper", helper],
            );
            let output = command::run(&mut cmd).await?;
            if !output.status.success() {
                return Err(GitError::Failed {
                    operation: "config",
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            info!("Installed git credential helper");
            Ok(true)
        }
        code => Err(GitError::Failed {
            operation: "config",
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}
