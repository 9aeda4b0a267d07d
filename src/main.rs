use anyhow::Context;
use hookrelay::config::Config;
use hookrelay::forward::{ForwardSettings, Forwarder};
use hookrelay::git;
use hookrelay::listener::{self, FdHandoff, ListenerHandoff};
use hookrelay::pipeline::Pipeline;
use hookrelay::router::{ProcessLauncher, Probe, Router};
use hookrelay::server::{AppState, Previews, RelayServer};
use hookrelay::status::StatusReporter;
use hookrelay::webhooks::WebhookHandler;
use std::ffi::OsString;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// What the process should do once it stops serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Shutdown,
    Reload,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Must happen before anything else: the file behind our image may be
    // replaced by the time a reload is requested.
    let exe = std::env::current_exe().context("unable to resolve own executable")?;
    let argv: Vec<OsString> = std::env::args_os().collect();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hookrelay=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = argv
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), exe = %exe.display(), "Configuration loaded");

    if config.github.user.is_some() {
        match git::ensure_credential_helper().await {
            Ok(true) => {}
            Ok(false) => info!("Using existing git credential helper"),
            Err(e) => warn!(error = %e, "Unable to configure git credential helper"),
        }
    }

    let reporter = StatusReporter::new(&config.github)?;
    if reporter.is_test_mode() {
        info!("Status reporting in test mode, origin host will not be contacted");
    }
    if let Some(ref hook_url) = config.github.hook_url {
        reporter.register_hooks(&config.github.repositories, hook_url).await;
    }

    let pipeline = Arc::new(Pipeline::new(
        config.pipeline.clone(),
        config.server.public_url.clone(),
        reporter,
    ));

    let previews = match config.qa.domain {
        Some(ref domain) => {
            let launcher = ProcessLauncher::from_config(&config.qa)?;
            let router = Router::new(config.qa.capacity, Arc::new(launcher), Probe::from(&config.qa));
            info!(domain = %domain, capacity = config.qa.capacity, "Preview backends enabled");
            Some(Previews {
                domain: domain.to_lowercase(),
                router,
            })
        }
        None => None,
    };
    let router = previews.as_ref().map(|p| p.router.clone());

    let handoff = FdHandoff::new(config.server.bind_address());
    let listener = Arc::new(handoff.acquire(FdHandoff::inherited_fd())?);

    let state = Arc::new(AppState {
        webhook: WebhookHandler::new(Arc::clone(&pipeline), config.server.webhook_secret.clone()),
        previews,
        forwarder: Forwarder::new(&ForwardSettings::from(&config.server)),
        log_dir: config.pipeline.log_dir.clone(),
        request_timeout: config.server.request_timeout(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = RelayServer::new(Arc::clone(&listener), state, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Relay server error");
        }
    });

    let (control_tx, control_rx) = mpsc::channel(4);
    if std::io::stdin().is_terminal() {
        spawn_interactive(control_tx.clone());
    }

    let action = wait_for_control(control_rx).await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    if let Some(router) = router {
        info!("Stopping preview backends...");
        router.shutdown().await;
    }

    match action {
        Control::Shutdown => {
            info!("Shutdown complete");
            Ok(())
        }
        Control::Reload => {
            let token = handoff.export(&listener)?;
            let err = listener::reexec(&exe, &argv, &token);
            Err(anyhow::anyhow!("re-exec of {} failed: {}", exe.display(), err))
        }
    }
}

/// Wait for a signal or an interactive command.
async fn wait_for_control(mut control_rx: mpsc::Receiver<Control>) -> anyhow::Result<Control> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    let action = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
            Control::Shutdown
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            Control::Shutdown
        }
        _ = sighup.recv() => {
            info!("Received SIGHUP, reloading...");
            Control::Reload
        }
        Some(action) = control_rx.recv() => {
            info!(?action, "Interactive command");
            action
        }
    };
    Ok(action)
}

/// Read commands from the terminal: `q` quits, `r` reloads.
///
/// Runs on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_interactive(control_tx: mpsc::Sender<Control>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let action = match line.trim() {
                "q" => Control::Shutdown,
                "r" => Control::Reload,
                "" => continue,
                other => {
                    info!(command = other, "Unknown command ('q' quits, 'r' reloads)");
                    continue;
                }
            };
            let _ = control_tx.blocking_send(action);
            return;
        }
        // End of input
        let _ = control_tx.blocking_send(Control::Shutdown);
    });
}
