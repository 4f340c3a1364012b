//! Worker threads: the receiving side of a handoff.
//!
//! A resident worker loops announcing readiness, waiting for a descriptor,
//! and serving the connection it names. A transient worker serves the one
//! connection it was launched with. Every failure inside a connection
//! (handshake, handler, I/O) stays inside that connection; only a closed
//! channel or a termination request ends a resident worker.


use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use quay_transport::{DescriptorChannel, Environment, Session, SessionConfig, TransportError};
use tracing::{debug, info, warn};

use crate::handler::ConnectionHandler;
use crate::pool::{ExitNotice, PoolError, WorkerHandle, WorkerId, WorkerLaunch, WorkerSpawner};

const WORKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::worker");

/// Everything a worker needs to serve connections.
pub struct WorkerContext {
    handler: Arc<dyn ConnectionHandler>,
    environment: Arc<Environment>,
    session: SessionConfig,
}

impl WorkerContext {
    /// Bundles the resolved handler, the shared environment and the
    /// session defaults.
    #[must_use]
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        environment: Arc<Environment>,
        session: SessionConfig,
    ) -> Self {
        Self {
            handler,
            environment,
            session,
        }
    }
}

/// Termination state shared between a worker and its handle.
#[derive(Debug, Default)]
pub(crate) struct WorkerControl {
    stopping: AtomicBool,
    active: Mutex<Option<TcpStream>>,
}

impl WorkerControl {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Raises the stop flag and severs the connection being served.
    pub(crate) fn terminate(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        sever(active.as_ref());
    }

    /// Records the connection being served. A stop requested before the
    /// connection was recorded severs it here instead.
    fn track(&self, stream: Option<TcpStream>) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = stream;
        if self.is_stopping() {
            sever(active.as_ref());
        }
    }
}

fn sever(stream: Option<&TcpStream>) {
    if let Some(connection) = stream
        && let Err(error) = connection.shutdown(Shutdown::Both)
    {
        // NotConnected once the peer is gone; the session notices either way.
        debug!(target: WORKER_TARGET, error = %error, "connection shutdown failed");
    }
}

/// Spawns each worker on its own named thread.
pub struct ThreadSpawner {
    context: Arc<WorkerContext>,
}

impl ThreadSpawner {
    /// Creates a spawner sharing `context` with every worker.
    #[must_use]
    pub fn new(context: WorkerContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }
}

/// Handle to a worker thread.
#[derive(Debug)]
pub struct ThreadWorker {
    worker: WorkerId,
    control: Arc<WorkerControl>,
    thread: JoinHandle<()>,
}

impl WorkerSpawner for ThreadSpawner {
    type Handle = ThreadWorker;

    fn spawn(
        &mut self,
        worker: WorkerId,
        launch: WorkerLaunch,
        notice: ExitNotice,
    ) -> Result<ThreadWorker, PoolError> {
        let control = Arc::new(WorkerControl::default());
        let context = Arc::clone(&self.context);
        let worker_control = Arc::clone(&control);
        let thread = thread::Builder::new()
            .name(format!("quay-worker-{worker}"))
            .spawn(move || {
                // Declared first so it is dropped last.
                let _notice = notice;
                match launch {
                    WorkerLaunch::Resident(channel) => {
                        run_resident(worker, &context, &worker_control, &channel);
                    }
                    WorkerLaunch::Transient(stream) => {
                        serve(worker, &context, &worker_control, stream);
                    }
                }
            })
            .map_err(|source| PoolError::Spawn { worker, source })?;
        Ok(ThreadWorker {
            worker,
            control,
            thread,
        })
    }
}

impl WorkerHandle for ThreadWorker {
    fn terminate(&self) {
        self.control.terminate();
    }

    fn join(self) -> Result<(), PoolError> {
        self.thread
            .join()
            .map_err(|_| PoolError::WorkerPanicked {
                worker: self.worker,
            })
    }
}

/// Serves connections handed over `channel` until it closes or the worker
/// is told to stop.
pub(crate) fn run_resident(
    worker: WorkerId,
    context: &WorkerContext,
    control: &WorkerControl,
    channel: &DescriptorChannel,
) {
    debug!(target: WORKER_TARGET, %worker, "resident worker started");
    while !control.is_stopping() {
        if let Err(error) = channel.announce_ready() {
            log_channel_end(worker, control, &error);
            break;
        }
        match channel.receive_descriptor(None) {
            Ok(fd) => serve(worker, context, control, TcpStream::from(fd)),
            Err(TransportError::ConnectionClosed) => {
                debug!(target: WORKER_TARGET, %worker, "channel closed by daemon");
                break;
            }
            Err(error @ TransportError::Protocol { .. }) => {
                warn!(
                    target: WORKER_TARGET,
                    %worker,
                    error = %error,
                    "malformed handoff ignored"
                );
            }
            Err(error) => {
                log_channel_end(worker, control, &error);
                break;
            }
        }
    }
    debug!(target: WORKER_TARGET, %worker, "resident worker exiting");
}

/// Establishes a session over `stream`, runs the handler and closes the
/// session whatever the handler returned.
pub(crate) fn serve(
    worker: WorkerId,
    context: &WorkerContext,
    control: &WorkerControl,
    stream: TcpStream,
) {
    if control.is_stopping() {
        return;
    }
    control.track(stream.try_clone().ok());
    let environment = Arc::clone(&context.environment);
    match Session::accept(stream, Some(environment), Some(&context.session)) {
        Ok(mut session) => {
            let peer = session.peer_addr();
            debug!(target: WORKER_TARGET, %worker, ?peer, "serving connection");
            match context.handler.handle(&mut session) {
                Ok(()) => debug!(target: WORKER_TARGET, %worker, ?peer, "handler finished"),
                Err(error) => warn!(
                    target: WORKER_TARGET,
                    %worker,
                    ?peer,
                    error = %error,
                    "handler failed"
                ),
            }
            if session.is_open()
                && let Err(error) = session.close()
            {
                debug!(
                    target: WORKER_TARGET,
                    %worker,
                    ?peer,
                    error = %error,
                    "session close reported an error"
                );
            }
        }
        Err(error) => {
            info!(
                target: WORKER_TARGET,
                %worker,
                error = %error,
                "session setup failed"
            );
        }
    }
    control.track(None);
}

fn log_channel_end(worker: WorkerId, control: &WorkerControl, error: &TransportError) {
    if control.is_stopping() {
        debug!(target: WORKER_TARGET, %worker, error = %error, "channel ended during shutdown");
    } else {
        warn!(target: WORKER_TARGET, %worker, error = %error, "worker channel failed");
    }
}
