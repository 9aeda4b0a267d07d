//! Listening socket handoff across process generations
//!
//! The listening socket is bound once. On reload the process replaces its own
//! image, and the successor adopts the still-open descriptor named in
//! `HOOKRELAY_LISTEN_FD` instead of binding again, so there is no window in
//! which connections are refused.

use anyhow::Context;
use std::ffi::OsString;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use tokio::net::TcpListener;
use tracing::info;

/// Environment variable naming an inherited listening descriptor
pub const LISTEN_FD_ENV: &str = "HOOKRELAY_LISTEN_FD";

/// Obtains a listener for this generation and hands it to the next one.
pub trait ListenerHandoff {
    /// Adopt `inherited` when present, otherwise create a fresh listener.
    fn acquire(&self, inherited: Option<RawFd>) -> anyhow::Result<TcpListener>;

    /// Make `listener` survive into a successor, returning the token the
    /// successor needs to adopt it.
    fn export(&self, listener: &TcpListener) -> anyhow::Result<String>;
}

/// Descriptor inheritance through `exec`
pub struct FdHandoff {
    bind_addr: String,
}

impl FdHandoff {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }

    /// Descriptor passed in by a predecessor, if any
    pub fn inherited_fd() -> Option<RawFd> {
        parse_fd(std::env::var(LISTEN_FD_ENV).ok().as_deref())
    }
}

fn parse_fd(value: Option<&str>) -> Option<RawFd> {
    value?.trim().parse::<RawFd>().ok().filter(|fd| *fd >= 0)
}

impl ListenerHandoff for FdHandoff {
    fn acquire(&self, inherited: Option<RawFd>) -> anyhow::Result<TcpListener> {
        let listener = match inherited {
            Some(fd) => {
                // Reject descriptors that are not open before taking ownership.
                set_cloexec(fd, true).with_context(|| format!("inherited descriptor {} is not usable", fd))?;
                info!(fd, "Adopting inherited listener");
                unsafe { std::net::TcpListener::from_raw_fd(fd) }
            }
            None => std::net::TcpListener::bind(&self.bind_addr)
                .with_context(|| format!("unable to listen on {}", self.bind_addr))?,
        };

        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        info!(addr = %listener.local_addr()?, "Listening");
        Ok(listener)
    }

    fn export(&self, listener: &TcpListener) -> anyhow::Result<String> {
        let fd = listener.as_raw_fd();
        set_cloexec(fd, false).context("failed to clear close-on-exec on listener")?;
        Ok(fd.to_string())
    }
}

fn set_cloexec(fd: RawFd, enabled: bool) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error());
    }
    let wanted = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if wanted != flags && unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Replace the current process image with `exe`, passing `token` so the new
/// image can adopt the exported listener.
///
/// Only returns on failure.
pub fn reexec(exe: &Path, argv: &[OsString], token: &str) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    info!(exe = %exe.display(), "Re-executing");
    let mut cmd = std::process::Command::new(exe);
    if let Some((arg0, args)) = argv.split_first() {
        cmd.arg0(arg0).args(args);
    }
    cmd.env(LISTEN_FD_ENV, token).exec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;

    fn cloexec(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags != -1);
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn test_parse_fd() {
        assert_eq!(parse_fd(Some("3")), Some(3));
        assert_eq!(parse_fd(Some(" 7\n")), Some(7));
        assert_eq!(parse_fd(Some("-1")), None);
        assert_eq!(parse_fd(Some("three")), None);
        assert_eq!(parse_fd(None), None);
    }

    #[tokio::test]
    async fn test_acquire_binds_fresh_listener() {
        let handoff = FdHandoff::new("127.0.0.1:0");
        let listener = handoff.acquire(None).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
        assert!(cloexec(listener.as_raw_fd()));
    }

    #[tokio::test]
    async fn test_export_then_adopt() {
        let handoff = FdHandoff::new("127.0.0.1:0");
        let listener = handoff.acquire(None).unwrap();
        let addr = listener.local_addr().unwrap();

        let token = handoff.export(&listener).unwrap();
        assert!(!cloexec(listener.as_raw_fd()));

        // Simulate the successor: it only knows the token.
        let fd = listener.into_std().unwrap().into_raw_fd();
        assert_eq!(parse_fd(Some(&token)), Some(fd));

        let adopted = handoff.acquire(parse_fd(Some(&token))).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);
        assert!(cloexec(adopted.as_raw_fd()));

        let client = tokio::net::TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(adopted.accept(), client);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_rejects_closed_descriptor() {
        let handoff = FdHandoff::new("127.0.0.1:0");
        let err = handoff.acquire(Some(987_654)).unwrap_err();
        assert!(err.to_string().contains("987654"));
    }
}
