//! The dispatch loop: accept, select a worker, hand off.
//!
//! The loop waits on two descriptors at once: the listening socket and the
//! waker's read end. Worker exits and shutdown requests arrive through the
//! waker, so the loop is the single thread that mutates the slot table.


use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use quay_transport::{Deadline, Direction, TransportError, poll_until};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::listener::Listener;
use crate::pool::{WorkerPool, WorkerSpawner};
use crate::waker::{WakeHandle, Waker};

pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// How long shutdown waits for workers before detaching them.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that end the dispatch loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Waiting on the listener and waker failed.
    #[error("dispatch loop poll failed: {source}")]
    Poll {
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// The waker could not be drained.
    #[error("failed to drain waker: {source}")]
    Waker {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The dispatch thread could not be started.
    #[error("failed to spawn dispatch thread: {source}")]
    Thread {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The dispatch thread panicked.
    #[error("dispatch thread panicked")]
    ThreadPanic,
}

/// Requests the dispatch loop to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: WakeHandle,
}

impl ShutdownHandle {
    /// Raises the flag and wakes the loop.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

type EndListener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct EndState {
    ended: bool,
    listeners: Vec<EndListener>,
}

impl fmt::Debug for EndState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndState")
            .field("ended", &self.ended)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Observes the end of a spawned dispatch loop, whether it was asked to
/// stop, failed or panicked.
#[derive(Debug, Clone, Default)]
pub struct LoopExit {
    state: Arc<Mutex<EndState>>,
}

impl LoopExit {
    /// Whether the dispatch thread has finished.
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.lock().ended
    }

    /// Runs `listener` once the loop has ended; straight away if it
    /// already has.
    pub fn on_end(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if state.ended {
            drop(state);
            listener();
        } else {
            state.listeners.push(Box::new(listener));
        }
    }

    pub(crate) fn mark_ended(&self) {
        let listeners = {
            let mut state = self.lock();
            state.ended = true;
            mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EndState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the loop ended when the dispatch thread lets go of it, including
/// while unwinding.
struct EndOnDrop(LoopExit);

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        self.0.mark_ended();
    }
}

/// Owns the listener, the pool and the waker.
pub struct Dispatcher<S: WorkerSpawner> {
    listener: Listener,
    pool: WorkerPool<S>,
    waker: Waker,
    shutdown: ShutdownHandle,
    shutdown_timeout: Duration,
}

impl<S: WorkerSpawner> Dispatcher<S> {
    /// Assembles a dispatcher. `pool` must have been created with a handle
    /// to `waker` so worker exits interrupt the loop.
    pub fn new(listener: Listener, pool: WorkerPool<S>, waker: Waker) -> Self {
        let shutdown = ShutdownHandle {
            flag: Arc::new(AtomicBool::new(false)),
            waker: waker.handle(),
        };
        Self {
            listener,
            pool,
            waker,
            shutdown,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Overrides how long shutdown waits for workers.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Handle that stops [`run`](Self::run).
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Runs until the shutdown handle fires, then closes the listener and
    /// terminates every worker.
    pub fn run(self) -> Result<(), DispatchError> {
        let Self {
            listener,
            mut pool,
            waker,
            shutdown,
            shutdown_timeout,
        } = self;
        info!(
            target: DISPATCH_TARGET,
            addr = %listener.local_addr(),
            "dispatch loop running"
        );
        let outcome = serve(&listener, &mut pool, &waker, &shutdown);
        drop(listener);
        let stragglers = pool.terminate_all(shutdown_timeout);
        info!(
            target: DISPATCH_TARGET,
            stragglers,
            "dispatch loop stopped"
        );
        outcome
    }

    /// Runs the loop on a dedicated thread.
    pub fn spawn(self) -> Result<DispatcherHandle, DispatchError>
    where
        S: Send + 'static,
        S::Handle: Send,
    {
        let shutdown = self.shutdown_handle();
        let local_addr = self.local_addr();
        let exit = LoopExit::default();
        let marker = EndOnDrop(exit.clone());
        let join = thread::Builder::new()
            .name("quay-dispatch".to_owned())
            .spawn(move || {
                let _marker = marker;
                let outcome = self.run();
                if let Err(error) = &outcome {
                    warn!(
                        target: DISPATCH_TARGET,
                        error = %error,
                        "dispatch loop failed"
                    );
                }
                outcome
            })
            .map_err(|source| DispatchError::Thread { source })?;
        Ok(DispatcherHandle {
            shutdown,
            local_addr,
            exit,
            join: Some(join),
        })
    }
}

fn serve<S: WorkerSpawner>(
    listener: &Listener,
    pool: &mut WorkerPool<S>,
    waker: &Waker,
    shutdown: &ShutdownHandle,
) -> Result<(), DispatchError> {
    let mut last_error = None::<io::ErrorKind>;
    loop {
        let readiness = poll_until(
            &[listener.as_fd(), waker.as_fd()],
            Direction::Readable,
            Deadline::never(),
        )
        .map_err(|source| DispatchError::Poll { source })?;
        let (accept_ready, wake_ready) = match readiness.as_slice() {
            [accept_ready, wake_ready] => (*accept_ready, *wake_ready),
            _ => (false, false),
        };
        if wake_ready {
            waker
                .drain()
                .map_err(|source| DispatchError::Waker { source })?;
        }
        pool.reap();
        if shutdown.is_triggered() {
            debug!(target: DISPATCH_TARGET, "shutdown requested");
            return Ok(());
        }
        if accept_ready {
            accept_pending(listener, pool, &mut last_error);
        }
    }
}

/// Dispatches every queued connection.
fn accept_pending<S: WorkerSpawner>(
    listener: &Listener,
    pool: &mut WorkerPool<S>,
    last_error: &mut Option<io::ErrorKind>,
) {
    loop {
        match listener.accept() {
            Ok(Some((stream, peer))) => {
                *last_error = None;
                pool.dispatch(stream, peer);
            }
            Ok(None) => return,
            Err(error) => {
                let kind = error.io_kind();
                if *last_error != kind {
                    warn!(
                        target: DISPATCH_TARGET,
                        error = %error,
                        "accept failed"
                    );
                }
                *last_error = kind;
                // Descriptor exhaustion keeps the listener readable.
                thread::sleep(ERROR_BACKOFF);
                return;
            }
        }
    }
}

/// Controls a dispatch loop running on its own thread.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: ShutdownHandle,
    local_addr: SocketAddr,
    exit: LoopExit,
    join: Option<JoinHandle<Result<(), DispatchError>>>,
}

impl DispatcherHandle {
    /// Asks the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops the loop from elsewhere.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Observer that fires when the dispatch thread finishes.
    #[must_use]
    pub fn loop_exit(&self) -> LoopExit {
        self.exit.clone()
    }

    /// Waits for the loop and its workers to finish.
    pub fn join(mut self) -> Result<(), DispatchError> {
        match self.join.take() {
            Some(handle) => handle.join().map_err(|_| DispatchError::ThreadPanic)?,
            None => Ok(()),
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
