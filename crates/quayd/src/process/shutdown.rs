//! Blocks the launch thread until the process is asked to stop.

use std::io;
use std::time::Duration;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{debug, info};

use super::PROCESS_TARGET;
use crate::dispatch::LoopExit;

/// Abstraction over shutdown notification mechanisms.
pub trait ShutdownSignal: Send + Sync {
    /// Blocks until shutdown should proceed or `dispatch` reports that the
    /// dispatch loop has already ended.
    fn wait(&self, dispatch: &LoopExit) -> Result<(), ShutdownError>;
}

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Waits for `SIGTERM`, `SIGINT` or `SIGQUIT`. `SIGHUP` is absorbed so a
/// closing terminal does not stop a foreground daemon.
#[derive(Debug, Clone)]
pub struct SystemShutdownSignal {
    grace: Duration,
}

impl SystemShutdownSignal {
    /// Builds a listener that reports `grace` as the worker drain budget.
    #[must_use]
    pub const fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self, dispatch: &LoopExit) -> Result<(), ShutdownError> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| ShutdownError::Install { source })?;
        let handle = signals.handle();
        dispatch.on_end(move || handle.close());
        for signal in signals.forever() {
            if signal == SIGHUP {
                debug!(target: PROCESS_TARGET, signal, "hangup ignored");
                continue;
            }
            info!(
                target: PROCESS_TARGET,
                signal,
                grace_ms = self.grace.as_millis(),
                "shutdown signal received"
            );
            break;
        }
        Ok(())
    }
}
