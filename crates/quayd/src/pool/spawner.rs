//! Seams between the pool and whatever runs a worker.

use std::net::TcpStream;
use std::sync::mpsc::Sender;

use quay_transport::DescriptorChannel;

use super::PoolError;
use super::slot::WorkerId;
use crate::waker::WakeHandle;

/// What a new worker starts with.
#[derive(Debug)]
pub enum WorkerLaunch {
    /// The worker's end of its descriptor channel.
    Resident(DescriptorChannel),
    /// The accepted connection the worker serves before exiting.
    Transient(TcpStream),
}

/// Lifecycle events reported by workers to the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker has stopped running.
    Exited(WorkerId),
}

/// Reports a worker's exit when dropped.
///
/// The worker owns its notice for its whole run, so the event fires on
/// normal return and while unwinding from a panic alike.
#[derive(Debug)]
pub struct ExitNotice {
    worker: WorkerId,
    events: Sender<WorkerEvent>,
    waker: WakeHandle,
}

impl ExitNotice {
    pub(super) const fn new(worker: WorkerId, events: Sender<WorkerEvent>, waker: WakeHandle) -> Self {
        Self {
            worker,
            events,
            waker,
        }
    }

    /// Worker this notice belongs to.
    #[must_use]
    pub const fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if self.events.send(WorkerEvent::Exited(self.worker)).is_ok() {
            self.waker.wake();
        }
    }
}

/// Starts workers for the pool.
pub trait WorkerSpawner {
    /// Handle kept in the worker's slot.
    type Handle: WorkerHandle;

    /// Starts worker `worker`. The notice must live exactly as long as the
    /// worker runs.
    fn spawn(
        &mut self,
        worker: WorkerId,
        launch: WorkerLaunch,
        notice: ExitNotice,
    ) -> Result<Self::Handle, PoolError>;
}

/// Control over one running worker.
pub trait WorkerHandle {
    /// Asks the worker to stop, interrupting any connection it is serving.
    fn terminate(&self);

    /// Waits for an exited worker to finish tearing down.
    fn join(self) -> Result<(), PoolError>;
}
