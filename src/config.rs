use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the relay
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Build pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Origin host API settings
    #[serde(default)]
    pub github: GithubConfig,

    /// Preview backend settings
    #[serde(default)]
    pub qa: QaConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listening port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Externally reachable base URL, used for status links to build logs
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Shared secret for X-Hub-Signature-256 verification (optional)
    pub webhook_secret: Option<String>,

    /// Maximum idle connections per preview backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a preview backend to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            public_url: default_public_url(),
            webhook_secret: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Pushers whose events are built; everyone else is refused
    #[serde(default)]
    pub allowed_pushers: HashSet<String>,

    /// Base directory for bare mirrors (default: repo)
    #[serde(default = "default_mirror_dir")]
    pub mirror_dir: PathBuf,

    /// Base directory for build logs (default: logs)
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Name of the build script looked up at the root of each commit
    #[serde(default = "default_hook_name")]
    pub hook_name: String,

    /// Deadline for refreshing an existing mirror (default: 20)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Deadline for the build script; unset means it may run indefinitely
    pub hook_timeout_secs: Option<u64>,
}

impl PipelineConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn hook_timeout(&self) -> Option<Duration> {
        self.hook_timeout_secs.map(Duration::from_secs)
    }

    /// Allow `pusher` (builder pattern)
    pub fn allow(mut self, pusher: &str) -> Self {
        self.allowed_pushers.insert(pusher.to_string());
        self
    }

    pub fn is_allowed(&self, pusher: &str) -> bool {
        self.allowed_pushers.contains(pusher)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            allowed_pushers: HashSet::new(),
            mirror_dir: default_mirror_dir(),
            log_dir: default_log_dir(),
            hook_name: default_hook_name(),
            fetch_timeout_secs: default_fetch_timeout(),
            hook_timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    /// REST API base (default: https://api.github.com)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API user; when unset, status reports are skipped
    pub user: Option<String>,

    /// API password or token
    pub password: Option<String>,

    /// Skip every network call and pretend it succeeded
    #[serde(default)]
    pub test_mode: bool,

    /// Repositories (`org/name`) to register a push hook on at startup
    #[serde(default)]
    pub repositories: Vec<String>,

    /// URL the registered hooks deliver to
    pub hook_url: Option<String>,

    /// Status context label
    #[serde(default = "default_status_context")]
    pub context: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            user: None,
            password: None,
            test_mode: false,
            repositories: Vec::new(),
            hook_url: None,
            context: default_status_context(),
        }
    }
}

/// Preview backend configuration
///
/// # Security Warning
///
/// `command` and `args` are executed directly for every preview host that
/// receives traffic. Protect the configuration file accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct QaConfig {
    /// Domain suffix for preview hosts; unset disables preview routing
    pub domain: Option<String>,

    /// Number of previews kept running at once (default: 5)
    #[serde(default = "default_qa_capacity")]
    pub capacity: usize,

    /// Command that starts a preview backend
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the command
    pub working_dir: Option<PathBuf>,

    /// Delay between readiness probes in milliseconds (default: 100)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Readiness probes before giving up (default: 600)
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
}

impl QaConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn enabled(&self) -> bool {
        self.domain.is_some()
    }
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            domain: None,
            capacity: default_qa_capacity(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            probe_interval_ms: default_probe_interval(),
            probe_attempts: default_probe_attempts(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_mirror_dir() -> PathBuf {
    PathBuf::from("repo")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_hook_name() -> String {
    "relay.hook".to_string()
}

fn default_fetch_timeout() -> u64 {
    20
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_status_context() -> String {
    "hookrelay".to_string()
}

fn default_qa_capacity() -> usize {
    5
}

fn default_probe_interval() -> u64 {
    100
}

fn default_probe_attempts() -> u32 {
    600 // 60s at the default interval
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides: `GITHUB_USER`, `GITHUB_PASSWORD`, `HOOKRELAY_TEST`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup("GITHUB_USER").filter(|v| !v.is_empty()) {
            self.github.user = Some(user);
        }
        if let Some(password) = lookup("GITHUB_PASSWORD").filter(|v| !v.is_empty()) {
            self.github.password = Some(password);
        }
        if lookup("HOOKRELAY_TEST").is_some_and(|v| !v.is_empty()) {
            self.github.test_mode = true;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let hook = &self.pipeline.hook_name;
        if hook.is_empty() || hook.contains('/') || hook == "." || hook == ".." {
            errors.push(format!("pipeline.hook_name '{}' must be a plain file name", hook));
        }

        if self.qa.capacity == 0 {
            errors.push("qa.capacity must be greater than 0".to_string());
        }

        if self.qa.probe_attempts == 0 {
            errors.push("qa.probe_attempts must be greater than 0".to_string());
        }

        if self.qa.enabled() && self.qa.command.is_none() {
            errors.push("qa.domain is set but qa.command is missing".to_string());
        }

        if !self.github.repositories.is_empty() && self.github.hook_url.is_none() {
            errors.push("github.repositories requires github.hook_url".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9000
bind = "127.0.0.1"
public_url = "https://ci.example.com"

[pipeline]
allowed_pushers = ["drj11", "pwaller"]
mirror_dir = "/var/lib/relay/repo"
hook_timeout_secs = 3600

[github]
user = "bot"
repositories = ["example/tang"]
hook_url = "https://ci.example.com/hook"

[qa]
domain = "qa.example.com"
command = "./serve"
args = ["--quiet"]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address(), "127.0.0.1:9000");
        assert!(config.pipeline.is_allowed("drj11"));
        assert!(!config.pipeline.is_allowed("mallory"));
        assert_eq!(config.pipeline.mirror_dir, PathBuf::from("/var/lib/relay/repo"));
        assert_eq!(config.pipeline.hook_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.github.user.as_deref(), Some("bot"));
        assert_eq!(config.qa.domain.as_deref(), Some("qa.example.com"));
        assert_eq!(config.qa.args, vec!["--quiet"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.pipeline.allowed_pushers.is_empty());
        assert_eq!(config.pipeline.mirror_dir, PathBuf::from("repo"));
        assert_eq!(config.pipeline.log_dir, PathBuf::from("logs"));
        assert_eq!(config.pipeline.hook_name, "relay.hook");
        assert_eq!(config.pipeline.fetch_timeout(), Duration::from_secs(20));
        assert_eq!(config.pipeline.hook_timeout(), None);
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert!(!config.github.test_mode);
        assert!(!config.qa.enabled());
        assert_eq!(config.qa.capacity, 5);
        assert_eq!(config.qa.probe_interval(), Duration::from_millis(100));
        assert_eq!(config.qa.probe_attempts, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "GITHUB_USER" => Some("bot".to_string()),
            "GITHUB_PASSWORD" => Some("hunter2".to_string()),
            "HOOKRELAY_TEST" => Some("1".to_string()),
            _ => None,
        });

        assert_eq!(config.github.user.as_deref(), Some("bot"));
        assert_eq!(config.github.password.as_deref(), Some("hunter2"));
        assert!(config.github.test_mode);
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = Config::default();
        config.apply_env(|_| Some(String::new()));

        assert!(config.github.user.is_none());
        assert!(!config.github.test_mode);
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[pipeline]
hook_name = "../evil"

[qa]
domain = "qa.example.com"
capacity = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("must be a plain file name"));
        assert!(err.contains("qa.capacity must be greater than 0"));
        assert!(err.contains("qa.command is missing"));
    }

    #[test]
    fn test_validate_hook_registration_needs_url() {
        let toml = r#"
[github]
repositories = ["example/tang"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("github.hook_url"));
    }

    #[test]
    fn test_allow_builder() {
        let pipeline = PipelineConfig::default().allow("testuser");
        assert!(pipeline.is_allowed("testuser"));
        assert!(!pipeline.is_allowed("testeviluser"));
    }
}
