//! Inbound push event documents

use serde::Deserialize;

/// Number of commit id characters used to name checkouts and log directories
pub const SHORT_SHA_LEN: usize = 6;

/// Whether `value` can be used as one file name below a directory we own:
/// non-empty, not `.` or `..`, and only `[A-Za-z0-9._-]`.
pub fn is_path_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Repository block of a push event
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub url: String,
}

impl Repository {
    /// `organization/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.organization, self.name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pusher {
    #[serde(default)]
    pub name: String,
}

/// Out-of-band flags not part of the upstream schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SideChannel {
    /// Stop before running the build script
    #[serde(default, rename = "nobuild")]
    pub no_build: bool,
    /// Answer the webhook only after the pipeline has finished
    #[serde(default)]
    pub wait: bool,
}

impl SideChannel {
    /// Pull just the side channel out of any event document.
    ///
    /// Documents that are not objects, or whose side channel is malformed,
    /// yield the default flags.
    pub fn peek(document: &[u8]) -> SideChannel {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default)]
            nongithub: SideChannel,
        }

        serde_json::from_slice::<Envelope>(document)
            .map(|e| e.nongithub)
            .unwrap_or_default()
    }
}

/// A push notification
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushEvent {
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub pusher: Pusher,
    #[serde(default, rename = "nongithub")]
    pub side_channel: SideChannel,
}

impl PushEvent {
    pub fn from_slice(document: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(document)
    }

    /// First [`SHORT_SHA_LEN`] characters of `after`, or all of it if shorter
    pub fn short_sha(&self) -> &str {
        short_sha(&self.after)
    }
}

pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(SHORT_SHA_LEN) {
        Some((idx, _)) => &sha[..idx],
        None => sha,
    }
}
