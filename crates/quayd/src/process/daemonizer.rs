//! Detaches the daemon from its terminal.

use std::ffi::OsStr;

use daemonize_me::Daemon;
use quay_config::RuntimePaths;
use thiserror::Error;
use tracing::info;

use super::PROCESS_TARGET;

/// Files created by the detached daemon are not world-accessible.
const DAEMON_UMASK: u16 = 0o027;

/// Abstraction over daemonisation strategies.
pub trait Daemonizer: Send + Sync {
    /// Detaches the process into the background.
    fn daemonize(&self, paths: &RuntimePaths) -> Result<(), DaemonizeError>;
}

/// Errors surfaced by the daemonisation backend.
#[derive(Debug, Error)]
pub enum DaemonizeError {
    /// System-level daemonisation failed.
    #[error("{0}")]
    System(#[from] daemonize_me::DaemonError),
}

/// Daemoniser backed by `daemonize-me`.
#[derive(Debug, Default)]
pub struct SystemDaemonizer;

impl SystemDaemonizer {
    /// Builds a new system daemoniser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Daemonizer for SystemDaemonizer {
    fn daemonize(&self, paths: &RuntimePaths) -> Result<(), DaemonizeError> {
        info!(
            target: PROCESS_TARGET,
            runtime = %paths.runtime_dir().display(),
            umask = format_args!("{DAEMON_UMASK:03o}"),
            "detaching from terminal"
        );
        Daemon::new()
            .umask(DAEMON_UMASK)
            .work_dir(paths.runtime_dir())
            .name(OsStr::new(env!("CARGO_PKG_NAME")))
            .start()?;
        info!(
            target: PROCESS_TARGET,
            pid = std::process::id(),
            "running detached"
        );
        Ok(())
    }
}
