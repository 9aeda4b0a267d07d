//! Hookrelay - a self-hosted CI relay
//!
//! This library provides:
//! - A build pipeline that mirrors a pushed repository, checks out the
//!   commit, runs the repository's build script and reports commit status
//! - An HTTP endpoint receiving push notifications
//! - On-demand preview backends, kept in a small LRU cache and reverse
//!   proxied by host name
//! - Listener handoff so the process can replace itself without dropping
//!   connections

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod forward;
pub mod git;
#[cfg(unix)]
pub mod listener;
pub mod logs;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod status;
pub mod webhooks;
