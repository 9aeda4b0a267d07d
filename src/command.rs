//! Subprocess execution
//!
//! Every external program the relay runs (git, build hooks) goes through this
//! module so that working directory, logging and output capture are handled
//! the same way everywhere.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors raised while running a subprocess
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started at all
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The program was killed because it ran past its deadline
    #[error("{program} timed out after {}s", after.as_secs())]
    Timeout { program: String, after: Duration },
    /// Reading output or waiting for the child failed
    #[error("{program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Build a command for `program` running inside `workdir`.
///
/// stdin is closed and stdout/stderr are inherited unless the caller captures
/// them with one of the `run*` helpers.
pub fn command<I, S>(workdir: &Path, program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let args: Vec<std::ffi::OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    debug!(wd = %workdir.display(), cmd = program, ?args, "Preparing command");

    let mut cmd = Command::new(program);
    cmd.args(&args);
    cmd.current_dir(workdir);
    cmd.stdin(Stdio::null());
    cmd
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

/// Run to completion, capturing stdout and stderr separately.
pub async fn run(cmd: &mut Command) -> Result<Output, CommandError> {
    let program = program_name(cmd);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.output()
        .await
        .map_err(|source| CommandError::Spawn { program, source })
}

/// Lines of stderr kept by [`run_with_timeout`]
const STDERR_TAIL_LINES: usize = 64;

/// How long to keep draining stderr after the child has exited
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// Exit status of a finished command and the last lines it wrote to stderr
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stderr: String,
}

/// Run to completion, killing the child if it is still running after `timeout`.
///
/// stdout is discarded. stderr is logged at debug level and its last lines
/// are returned with the exit status.
pub async fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Finished, CommandError> {
    let program = program_name(cmd);
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;
    let stderr = child.stderr.take();

    let stderr_task = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = stderr {
            each_line(stderr, |line| {
                let line = String::from_utf8_lossy(line).into_owned();
                debug!(target: "command", "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            })
            .await;
        }
        Vec::from(tail).join("\n")
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            stderr_task.abort();
            return Err(CommandError::Io { program, source });
        }
        Err(_) => {
            stderr_task.abort();
            let killed = child.kill().await;
            warn!(cmd = %program, timeout_secs = timeout.as_secs(), killed = killed.is_ok(), "Killed command after timeout");
            return Err(CommandError::Timeout { program, after: timeout });
        }
    };

    // A grandchild may still hold the pipe open; take what arrived by then.
    let stderr = match tokio::time::timeout(STDERR_DRAIN, stderr_task).await {
        Ok(Ok(tail)) => tail,
        _ => String::new(),
    };
    Ok(Finished { status, stderr })
}

/// Read `reader` to end of file, handing each line without its trailing
/// newline to `on_line`.
///
/// Lines are raw bytes: output that is not valid UTF-8 is passed through and
/// never stops the read, so the writer is not left facing a closed pipe.
pub async fn each_line<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => on_line(buf.strip_suffix(b"\n").unwrap_or(&buf[..])),
            Err(e) => {
                debug!(error = %e, "Output stream failed");
                break;
            }
        }
    }
}

/// Forward each line of `reader` into the shared channel.
///
/// Keeps draining after the receiver is gone.
fn pump<R>(reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        each_line(reader, |line| {
            let _ = tx.send(line.to_vec());
        })
        .await;
    })
}

/// Run to completion with stdout and stderr interleaved into `sink`.
///
/// Each line is also emitted through `tracing` under the `hook` target. When
/// `timeout` is set and expires, the child is killed and
/// [`CommandError::Timeout`] is returned; whatever output arrived before the
/// kill has already been written to `sink`.
pub async fn run_tee<W>(
    cmd: &mut Command,
    sink: &mut W,
    timeout: Option<Duration>,
) -> Result<ExitStatus, CommandError>
where
    W: AsyncWrite + Unpin,
{
    let program = program_name(cmd);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, tx.clone()));
    }
    drop(tx);

    let copy_and_wait = async {
        while let Some(line) = rx.recv().await {
            info!(target: "hook", "{}", String::from_utf8_lossy(&line));
            sink.write_all(&line).await?;
            sink.write_all(b"\n").await?;
        }
        sink.flush().await?;
        child.wait().await
    };

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, copy_and_wait).await {
            Ok(waited) => waited.map_err(|source| CommandError::Io {
                program: program.clone(),
                source,
            }),
            Err(_) => {
                let killed = child.kill().await;
                warn!(cmd = %program, timeout_secs = limit.as_secs(), killed = killed.is_ok(), "Killed command after timeout");
                Err(CommandError::Timeout {
                    program: program.clone(),
                    after: limit,
                })
            }
        },
        None => copy_and_wait.await.map_err(|source| CommandError::Io {
            program: program.clone(),
            source,
        }),
    };

    for handle in pumps {
        handle.abort();
    }
    result
}
