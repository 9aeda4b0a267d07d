//! Preview backend router
//!
//! Preview backends are addressed by `(ref, repository)` and kept in a fixed
//! capacity least-recently-used cache. The cache is owned by a single task;
//! callers talk to it through [`Router`], so lookup, insertion and eviction
//! never interleave and two requests for the same key can never spawn two
//! backends.
//!
//! Spawning returns immediately. Readiness is signalled separately, once a
//! polling task manages to connect to the backend's port (or gives up).

use crate::command;
use crate::config::QaConfig;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Routing key for a preview backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendKey {
    pub git_ref: String,
    pub repository: String,
}

impl BackendKey {
    pub fn new(git_ref: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            git_ref: git_ref.into(),
            repository: repository.into(),
        }
    }

    /// Parse `<ref>.<repository>.<domain>`.
    ///
    /// `host` must already be lowercased and stripped of any port. Exactly two
    /// non-empty labels may precede the domain.
    pub fn from_host(host: &str, domain: &str) -> Option<Self> {
        let domain = domain.trim_matches('.');
        let prefix = host.strip_suffix(domain)?.strip_suffix('.')?;
        let (git_ref, repository) = prefix.split_once('.')?;
        if git_ref.is_empty() || repository.is_empty() || repository.contains('.') {
            return None;
        }
        Some(Self::new(git_ref, repository))
    }
}

impl std::fmt::Display for BackendKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.git_ref, self.repository)
    }
}

/// Errors from starting or reaching a preview backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start backend {key}: {reason}")]
    Launch { key: String, reason: String },
    #[error("timed out trying to connect to :{port}")]
    NotReady { port: u16 },
    #[error("backend was stopped before it became ready")]
    Stopped,
    #[error("backend router has shut down")]
    RouterGone,
}

/// A started backend that can be forcefully terminated
pub trait RunningBackend: Send {
    fn stop(&mut self);
}

/// Starts backends for routing keys
pub trait Launcher: Send + Sync + 'static {
    /// Start a backend for `key` that will listen on `port`.
    fn launch(&self, key: &BackendKey, port: u16) -> anyhow::Result<Box<dyn RunningBackend>>;
}

/// Readiness polling parameters
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            attempts: 600,
        }
    }
}

impl From<&QaConfig> for Probe {
    fn from(config: &QaConfig) -> Self {
        Self {
            interval: config.probe_interval(),
            attempts: config.probe_attempts,
        }
    }
}

type Readiness = Option<Result<u16, BackendError>>;

/// A cached preview backend
pub struct Backend {
    key: BackendKey,
    port: u16,
    handle: parking_lot::Mutex<Option<Box<dyn RunningBackend>>>,
    probe_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    ready_rx: watch::Receiver<Readiness>,
}

impl Backend {
    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait until the backend is reachable, returning its port.
    ///
    /// Every caller sees the same result; a backend that failed to start
    /// keeps failing until it is evicted.
    pub async fn ready(&self) -> Result<u16, BackendError> {
        let mut rx = self.ready_rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(Err(BackendError::Stopped)),
            Err(_) => Err(BackendError::Stopped),
        };
        result
    }

    fn stop(&self) {
        if let Some(task) = self.probe_task.lock().take() {
            task.abort();
        }
        if let Some(mut handle) = self.handle.lock().take() {
            info!(key = %self.key, port = self.port, "Stopping backend");
            handle.stop();
        }
    }
}

enum Request {
    Resolve {
        key: BackendKey,
        reply: oneshot::Sender<Arc<Backend>>,
    },
    Keys {
        reply: oneshot::Sender<Vec<BackendKey>>,
    },
    Evictions {
        reply: oneshot::Sender<u64>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the backend cache owner
#[derive(Clone)]
pub struct Router {
    tx: mpsc::Sender<Request>,
}

impl Router {
    /// Start the owner task. Must be called inside a tokio runtime.
    pub fn new(capacity: usize, launcher: Arc<dyn Launcher>, probe: Probe) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let (tx, rx) = mpsc::channel(64);
        let owner = Owner {
            cache: LruCache::new(capacity),
            launcher,
            probe,
            evictions: 0,
        };
        tokio::spawn(owner.run(rx));
        info!(capacity = capacity.get(), "Backend router started");
        Self { tx }
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, BackendError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BackendError::RouterGone)?;
        rx.await.map_err(|_| BackendError::RouterGone)
    }

    /// Return the backend for `key`, starting one if it is not cached.
    pub async fn resolve(&self, key: BackendKey) -> Result<Arc<Backend>, BackendError> {
        self.ask(|reply| Request::Resolve { key, reply }).await
    }

    /// Cached keys, least recently used first
    pub async fn keys(&self) -> Result<Vec<BackendKey>, BackendError> {
        self.ask(|reply| Request::Keys { reply }).await
    }

    /// Number of backends stopped because the cache was full
    pub async fn evictions(&self) -> Result<u64, BackendError> {
        self.ask(|reply| Request::Evictions { reply }).await
    }

    /// Stop every cached backend and end the owner task.
    pub async fn shutdown(&self) {
        if self.ask(|reply| Request::Shutdown { reply }).await.is_err() {
            debug!("Backend router already stopped");
        }
    }
}

struct Owner {
    cache: LruCache<BackendKey, Arc<Backend>>,
    launcher: Arc<dyn Launcher>,
    probe: Probe,
    evictions: u64,
}

impl Owner {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Resolve { key, reply } => {
                    let backend = self.resolve(key);
                    let _ = reply.send(backend);
                }
                Request::Keys { reply } => {
                    let keys = self.cache.iter().rev().map(|(k, _)| k.clone()).collect();
                    let _ = reply.send(keys);
                }
                Request::Evictions { reply } => {
                    let _ = reply.send(self.evictions);
                }
                Request::Shutdown { reply } => {
                    self.stop_all();
                    let _ = reply.send(());
                    info!("Backend router shut down");
                    return;
                }
            }
        }
        self.stop_all();
    }

    fn resolve(&mut self, key: BackendKey) -> Arc<Backend> {
        if let Some(backend) = self.cache.get(&key) {
            debug!(key = %key, port = backend.port, "Reusing backend");
            return Arc::clone(backend);
        }

        let backend = Arc::new(self.spawn(&key));
        if let Some((evicted_key, evicted)) = self.cache.push(key, Arc::clone(&backend)) {
            info!(key = %evicted_key, "Evicting least recently used backend");
            evicted.stop();
            self.evictions += 1;
        }
        backend
    }

    fn spawn(&self, key: &BackendKey) -> Backend {
        let failed = |port, reason: String| {
            error!(key = %key, reason = %reason, "Backend failed to start");
            let (_, ready_rx) = watch::channel(Some(Err(BackendError::Launch {
                key: key.to_string(),
                reason,
            })));
            Backend {
                key: key.clone(),
                port,
                handle: parking_lot::Mutex::new(None),
                probe_task: parking_lot::Mutex::new(None),
                ready_rx,
            }
        };

        let port = match free_port() {
            Ok(port) => port,
            Err(e) => return failed(0, format!("no free port: {}", e)),
        };

        let handle = match self.launcher.launch(key, port) {
            Ok(handle) => handle,
            Err(e) => return failed(port, format!("{:#}", e)),
        };
        info!(key = %key, port, "Backend started, waiting for it to listen");

        let (ready_tx, ready_rx) = watch::channel(None);
        let probe = self.probe;
        let probe_key = key.clone();
        let probe_task = tokio::spawn(async move {
            let result = wait_for_listener(port, probe).await;
            match &result {
                Ok(_) => info!(key = %probe_key, port, "Backend ready"),
                Err(e) => warn!(key = %probe_key, port, error = %e, "Backend never became ready"),
            }
            let _ = ready_tx.send(Some(result));
        });

        Backend {
            key: key.clone(),
            port,
            handle: parking_lot::Mutex::new(Some(handle)),
            probe_task: parking_lot::Mutex::new(Some(probe_task)),
            ready_rx,
        }
    }

    fn stop_all(&mut self) {
        while let Some((_, backend)) = self.cache.pop_lru() {
            backend.stop();
        }
    }
}

/// Ask the kernel for a currently unused loopback port.
fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

async fn wait_for_listener(port: u16, probe: Probe) -> Result<u16, BackendError> {
    for _ in 0..probe.attempts {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(port);
        }
        tokio::time::sleep(probe.interval).await;
    }
    Err(BackendError::NotReady { port })
}

/// Launches preview backends as local processes.
///
/// The child gets `PORT`, `QA_BRANCH` and `QA_REPOSITORY` in its environment
/// and its output is forwarded to the log.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn from_config(config: &QaConfig) -> anyhow::Result<Self> {
        let command = config
            .command
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Preview backends require 'qa.command'"))?;
        Ok(Self {
            command: command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
        })
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, key: &BackendKey, port: u16) -> anyhow::Result<Box<dyn RunningBackend>> {
        info!(key = %key, command = %self.command, args = ?self.args, port, "Starting preview backend");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.working_dir {
            cmd.current_dir(working_dir);
        }
        for (name, value) in &self.env {
            cmd.env(name, value);
        }
        cmd.env("PORT", port.to_string());
        cmd.env("QA_BRANCH", &key.git_ref);
        cmd.env("QA_REPOSITORY", &key.repository);

        // Take the preview down with us if the relay dies without cleaning up.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("{}: {}", self.command, e))?;
        let label = key.to_string();
        info!(key = %label, pid = child.id().unwrap_or(0), "Preview backend spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, label.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, label.clone());
        }

        Ok(Box::new(ChildBackend { child, label }))
    }
}

fn forward_output<R>(reader: R, label: String)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        command::each_line(reader, |line| {
            info!(target: "backend", key = %label, "{}", String::from_utf8_lossy(line));
        })
        .await;
    });
}

struct ChildBackend {
    child: Child,
    label: String,
}

impl RunningBackend for ChildBackend {
    fn stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(key = %self.label, error = %e, "Error when killing backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Binds the assigned port so readiness probes succeed, and records
    /// starts and stops.
    #[derive(Default)]
    struct TestLauncher {
        launched: Arc<Mutex<Vec<BackendKey>>>,
        stopped: Arc<Mutex<Vec<BackendKey>>>,
        fail: bool,
        listen: bool,
    }

    struct TestBackend {
        key: BackendKey,
        _listener: Option<std::net::TcpListener>,
        stopped: Arc<Mutex<Vec<BackendKey>>>,
    }

    impl RunningBackend for TestBackend {
        fn stop(&mut self) {
            self._listener = None;
            self.stopped.lock().push(self.key.clone());
        }
    }

    impl Launcher for TestLauncher {
        fn launch(&self, key: &BackendKey, port: u16) -> anyhow::Result<Box<dyn RunningBackend>> {
            if self.fail {
                anyhow::bail!("no such command");
            }
            self.launched.lock().push(key.clone());
            let listener = if self.listen {
                Some(std::net::TcpListener::bind(("127.0.0.1", port))?)
            } else {
                None
            };
            Ok(Box::new(TestBackend {
                key: key.clone(),
                _listener: listener,
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    fn listening() -> TestLauncher {
        TestLauncher {
            listen: true,
            ..TestLauncher::default()
        }
    }

    fn fast_probe() -> Probe {
        Probe {
            interval: Duration::from_millis(10),
            attempts: 5,
        }
    }

    fn key(n: usize) -> BackendKey {
        BackendKey::new(format!("branch{}", n), "myrepo")
    }

    #[test]
    fn test_key_from_host() {
        let key = BackendKey::from_host("feature-x.myrepo.qa.example.com", "qa.example.com").unwrap();
        assert_eq!(key, BackendKey::new("feature-x", "myrepo"));
        assert_eq!(key.to_string(), "feature-x.myrepo");

        assert!(BackendKey::from_host("myrepo.qa.example.com", "qa.example.com").is_none());
        assert!(BackendKey::from_host("a.b.myrepo.qa.example.com", "qa.example.com").is_none());
        assert!(BackendKey::from_host(".myrepo.qa.example.com", "qa.example.com").is_none());
        assert!(BackendKey::from_host("x.myrepoqa.example.com", "qa.example.com").is_none());
        assert!(BackendKey::from_host("feature-x.myrepo.example.org", "qa.example.com").is_none());
        assert!(BackendKey::from_host("qa.example.com", "qa.example.com").is_none());
    }

    #[tokio::test]
    async fn test_resolve_reuses_backend() {
        let launcher = listening();
        let launched = Arc::clone(&launcher.launched);
        let router = Router::new(5, Arc::new(launcher), fast_probe());

        let first = router.resolve(key(1)).await.unwrap();
        let port = first.ready().await.unwrap();
        assert_eq!(port, first.port());

        let second = router.resolve(key(1)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(launched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_sixth_key_evicts_least_recent() {
        let launcher = listening();
        let stopped = Arc::clone(&launcher.stopped);
        let router = Router::new(5, Arc::new(launcher), fast_probe());

        for n in 0..6 {
            router.resolve(key(n)).await.unwrap();
        }

        assert_eq!(router.evictions().await.unwrap(), 1);
        assert_eq!(router.keys().await.unwrap(), (1..6).map(key).collect::<Vec<_>>());
        assert_eq!(*stopped.lock(), vec![key(0)]);
    }

    #[tokio::test]
    async fn test_resolve_marks_most_recently_used() {
        let launcher = listening();
        let stopped = Arc::clone(&launcher.stopped);
        let router = Router::new(5, Arc::new(launcher), fast_probe());

        for n in 0..5 {
            router.resolve(key(n)).await.unwrap();
        }
        router.resolve(key(0)).await.unwrap();
        router.resolve(key(5)).await.unwrap();

        assert_eq!(*stopped.lock(), vec![key(1)]);
        assert_eq!(
            router.keys().await.unwrap(),
            vec![key(2), key(3), key(4), key(0), key(5)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_resolves_spawn_once() {
        let launcher = listening();
        let launched = Arc::clone(&launcher.launched);
        let router = Router::new(5, Arc::new(launcher), fast_probe());

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move { router.resolve(key(7)).await.unwrap().port() }));
        }
        let mut ports = Vec::new();
        for task in tasks {
            ports.push(task.await.unwrap());
        }

        ports.dedup();
        assert_eq!(ports.len(), 1);
        assert_eq!(launched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_sticky() {
        let launcher = TestLauncher {
            fail: true,
            ..TestLauncher::default()
        };
        let router = Router::new(5, Arc::new(launcher), fast_probe());

        let backend = router.resolve(key(1)).await.unwrap();
        let err = backend.ready().await.unwrap_err();
        assert!(matches!(err, BackendError::Launch { .. }));
        assert!(err.to_string().contains("no such command"));

        // Still cached, still failing, not retried
        let again = router.resolve(key(1)).await.unwrap();
        assert!(Arc::ptr_eq(&backend, &again));
        assert!(again.ready().await.is_err());
    }

    #[tokio::test]
    async fn test_not_listening_times_out() {
        let launcher = TestLauncher::default();
        let router = Router::new(5, Arc::new(launcher), fast_probe());

        let backend = router.resolve(key(1)).await.unwrap();
        let err = backend.ready().await.unwrap_err();
        assert_eq!(err, BackendError::NotReady { port: backend.port() });
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let launcher = listening();
        let stopped = Arc::clone(&launcher.stopped);
        let router = Router::new(5, Arc::new(launcher), fast_probe());

        for n in 0..3 {
            router.resolve(key(n)).await.unwrap();
        }
        router.shutdown().await;

        assert_eq!(stopped.lock().len(), 3);
        assert!(matches!(
            router.resolve(key(9)).await,
            Err(BackendError::RouterGone)
        ));
    }

    #[tokio::test]
    async fn test_process_launcher_spawn_failure() {
        let launcher = ProcessLauncher::new("definitely-not-a-real-program");
        let err = launcher.launch(&key(1), 40000).err().unwrap();
        assert!(err.to_string().contains("definitely-not-a-real-program"));
    }

    #[tokio::test]
    async fn test_process_launcher_passes_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let script = format!(
            "echo \"$PORT $QA_BRANCH $QA_REPOSITORY\" > {}",
            out.display()
        );
        let launcher = ProcessLauncher::new("sh").args(["-c", script.as_str()]);

        let _backend = launcher.launch(&BackendKey::new("feature-x", "myrepo"), 41234).unwrap();

        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(&out).unwrap_or_default();
            if contents.ends_with('\n') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(contents.trim(), "41234 feature-x myrepo");
    }

    #[tokio::test]
    async fn test_process_launcher_survives_invalid_utf8_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("alive.txt");
        let script = format!(
            "printf '\\377\\376\\n'; sleep 0.2; \
             i=0; while [ $i -lt 5000 ]; do echo line $i; i=$((i+1)); done; \
             echo alive > {}",
            out.display()
        );
        let launcher = ProcessLauncher::new("sh").args(["-c", script.as_str()]);

        let _backend = launcher.launch(&BackendKey::new("feature-x", "myrepo"), 41235).unwrap();

        let mut contents = String::new();
        for _ in 0..250 {
            contents = std::fs::read_to_string(&out).unwrap_or_default();
            if contents.ends_with('\n') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(contents.trim(), "alive");
    }
}
