//! The worker pool and its slot table.
//!
//! The pool is owned by the dispatch loop and is the only writer of the
//! slot table. Workers never touch it: they report their exit through an
//! [`ExitNotice`], and the loop applies the queued events in [`reap`]
//! before each scan and whenever the waker fires.
//!
//! Selection relies on the descriptor channel's readiness byte. A resident
//! worker writes one byte when it is idle, so a zero-timeout `poll` over
//! every selectable channel finds the workers ready for a handoff without
//! ever blocking the loop.
//!
//! [`reap`]: WorkerPool::reap

mod slot;
mod spawner;


use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use quay_config::PoolLimits;
use quay_transport::{
    Deadline, DescriptorChannel, Direction, TransportError, poll_until,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::waker::WakeHandle;

pub use slot::{SlotState, SlotView, WorkerId, WorkerKind};
pub use spawner::{ExitNotice, WorkerEvent, WorkerHandle, WorkerLaunch, WorkerSpawner};

use slot::WorkerSlot;

pub(crate) const POOL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pool");

/// Errors raised while growing or shutting down the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Creating a descriptor channel for a resident worker failed.
    #[error("failed to create worker channel: {source}")]
    Channel {
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// The worker could not be started.
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        /// Worker that failed to start.
        worker: WorkerId,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The worker panicked instead of returning.
    #[error("worker {worker} panicked")]
    WorkerPanicked {
        /// Worker that panicked.
        worker: WorkerId,
    },
}

/// Why an accepted connection was closed without being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Every worker is busy and the pool is at its maximum.
    Saturated,
    /// Scanning the worker channels failed.
    SelectionFailed,
    /// The selected worker's channel refused the descriptor.
    HandoffFailed {
        /// Worker whose slot was retired.
        worker: WorkerId,
    },
    /// A transient worker could not be started.
    SpawnFailed,
}

/// What happened to one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Sent to an idle worker over its channel.
    HandedOff {
        /// Receiving worker.
        worker: WorkerId,
    },
    /// Given to a newly spawned transient worker.
    Spawned {
        /// New worker.
        worker: WorkerId,
    },
    /// Closed without being served.
    Dropped(DropReason),
}

enum Selection {
    Delivered(WorkerId),
    Failed(WorkerId),
    NoneReady,
    ScanFailed,
}

/// Workers, their slots, and the bounds on their number.
pub struct WorkerPool<S: WorkerSpawner> {
    spawner: S,
    slots: Vec<Option<WorkerSlot<S::Handle>>>,
    limits: PoolLimits,
    handoff_timeout: Duration,
    live: usize,
    next_worker: u64,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    waker: WakeHandle,
}

impl<S: WorkerSpawner> WorkerPool<S> {
    /// Creates an empty pool. Call [`start`](Self::start) to spawn the
    /// resident workers.
    pub fn new(spawner: S, limits: PoolLimits, handoff_timeout: Duration, waker: WakeHandle) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            spawner,
            slots: Vec::new(),
            limits,
            handoff_timeout,
            live: 0,
            next_worker: 0,
            events_tx,
            events_rx,
            waker,
        }
    }

    /// Spawns the resident workers, each over a fresh channel.
    pub fn start(&mut self) -> Result<(), PoolError> {
        for _ in 0..self.limits.resident() {
            let (daemon_end, worker_end) =
                DescriptorChannel::pair().map_err(|source| PoolError::Channel { source })?;
            let worker = self.allocate_worker();
            let notice = self.notice(worker);
            let handle = self
                .spawner
                .spawn(worker, WorkerLaunch::Resident(worker_end), notice)?;
            let index = self.install(WorkerSlot {
                worker,
                kind: WorkerKind::Resident,
                state: SlotState::Executing,
                channel: Some(daemon_end),
                retired: false,
                handle: Some(handle),
            });
            debug!(
                target: POOL_TARGET,
                slot = index,
                %worker,
                "resident worker spawned"
            );
        }
        info!(
            target: POOL_TARGET,
            resident = self.limits.resident(),
            max = self.limits.max(),
            "worker pool started"
        );
        Ok(())
    }

    /// Routes one accepted connection to a worker, or drops it.
    ///
    /// The daemon's copy of the connection is closed before returning in
    /// every case.
    pub fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) -> Dispatch {
        self.reap();
        let outcome = match self.select(&stream) {
            Selection::Delivered(worker) => Dispatch::HandedOff { worker },
            Selection::Failed(worker) => Dispatch::Dropped(DropReason::HandoffFailed { worker }),
            Selection::ScanFailed => Dispatch::Dropped(DropReason::SelectionFailed),
            Selection::NoneReady => self.grow(stream),
        };
        self.log_outcome(outcome, peer);
        outcome
    }

    /// Applies every queued worker event to the slot table.
    pub fn reap(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply(event);
        }
    }

    /// Stops every worker and waits up to `timeout` for them to exit.
    ///
    /// Returns the number of workers that did not exit in time; their
    /// threads are left detached.
    pub fn terminate_all(&mut self, timeout: Duration) -> usize {
        for slot in self.slots.iter_mut().flatten().filter(|slot| slot.is_live()) {
            if let Some(handle) = slot.handle.as_ref() {
                handle.terminate();
            }
            if let Some(channel) = slot.channel.as_ref()
                && let Err(error) = channel.shutdown()
            {
                debug!(
                    target: POOL_TARGET,
                    worker = %slot.worker,
                    error = %error,
                    "channel shutdown failed"
                );
            }
        }

        let deadline = Instant::now() + timeout;
        while self.live > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events_rx.recv_timeout(remaining) {
                Ok(event) => self.apply(event),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        let stragglers = self.live;
        for slot in self.slots.iter_mut().flatten().filter(|slot| slot.is_live()) {
            warn!(
                target: POOL_TARGET,
                worker = %slot.worker,
                "worker did not exit in time; detaching"
            );
            slot.channel = None;
            slot.handle = None;
            slot.state = SlotState::Terminated;
        }
        self.live = 0;
        info!(
            target: POOL_TARGET,
            stragglers,
            "worker pool stopped"
        );
        stragglers
    }

    /// Number of workers that have not exited.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }

    /// Normalised pool bounds.
    #[must_use]
    pub const fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    /// Copies the occupied slots.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SlotView> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|occupied| occupied.view(index)))
            .collect()
    }

    fn select(&mut self, stream: &TcpStream) -> Selection {
        let candidates: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(WorkerSlot::is_selectable))
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return Selection::NoneReady;
        }

        let scan = {
            let fds: Vec<BorrowedFd<'_>> = candidates
                .iter()
                .filter_map(|index| self.channel_at(*index))
                .map(AsFd::as_fd)
                .collect();
            poll_until(&fds, Direction::Readable, Deadline::after(Some(Duration::ZERO)))
        };
        let readiness = match scan {
            Ok(readiness) => readiness,
            Err(error) => {
                warn!(
                    target: POOL_TARGET,
                    error = %error,
                    "worker channel scan failed"
                );
                return Selection::ScanFailed;
            }
        };
        let readable: Vec<usize> = candidates
            .into_iter()
            .zip(readiness)
            .filter_map(|(index, ready)| ready.then_some(index))
            .collect();
        for index in &readable {
            if let Some(slot) = self.slot_mut(*index) {
                slot.state = SlotState::Idle;
            }
        }

        for index in readable {
            if let Some(selection) = self.try_hand_off(index, stream) {
                return selection;
            }
        }
        Selection::NoneReady
    }

    /// Claims the readiness byte on slot `index` and sends the connection.
    /// `None` means the slot was not usable and the scan should continue.
    fn try_hand_off(&mut self, index: usize, stream: &TcpStream) -> Option<Selection> {
        let timeout = self.handoff_timeout;
        let slot = self.slot_mut(index)?;
        let channel = slot.channel.as_ref()?;
        match channel.drain_ready() {
            Ok(()) => {}
            Err(TransportError::ConnectionClosed | TransportError::Timeout { .. }) => {
                // The worker is exiting (or the wake-up was spurious).
                debug!(
                    target: POOL_TARGET,
                    worker = %slot.worker,
                    "readable slot had no readiness byte; skipping"
                );
                return None;
            }
            Err(error) => {
                warn!(
                    target: POOL_TARGET,
                    worker = %slot.worker,
                    error = %error,
                    "failed to read readiness; retiring slot"
                );
                slot.retired = true;
                return None;
            }
        }
        match channel.send_descriptor(stream.as_fd(), Some(timeout)) {
            Ok(()) => {
                slot.state = SlotState::Executing;
                Some(Selection::Delivered(slot.worker))
            }
            Err(error) => {
                warn!(
                    target: POOL_TARGET,
                    worker = %slot.worker,
                    error = %error,
                    "descriptor handoff failed; retiring slot"
                );
                if let Err(shutdown) = channel.shutdown() {
                    debug!(
                        target: POOL_TARGET,
                        worker = %slot.worker,
                        error = %shutdown,
                        "channel shutdown failed"
                    );
                }
                slot.retired = true;
                Some(Selection::Failed(slot.worker))
            }
        }
    }

    fn grow(&mut self, stream: TcpStream) -> Dispatch {
        if self.live >= self.limits.max() {
            return Dispatch::Dropped(DropReason::Saturated);
        }
        let worker = self.allocate_worker();
        let notice = self.notice(worker);
        match self
            .spawner
            .spawn(worker, WorkerLaunch::Transient(stream), notice)
        {
            Ok(handle) => {
                self.install(WorkerSlot {
                    worker,
                    kind: WorkerKind::Transient,
                    state: SlotState::Executing,
                    channel: None,
                    retired: false,
                    handle: Some(handle),
                });
                Dispatch::Spawned { worker }
            }
            Err(error) => {
                warn!(
                    target: POOL_TARGET,
                    %worker,
                    error = %error,
                    "transient worker failed to start"
                );
                Dispatch::Dropped(DropReason::SpawnFailed)
            }
        }
    }

    fn apply(&mut self, event: WorkerEvent) {
        let WorkerEvent::Exited(worker) = event;
        let position = self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|occupied| occupied.worker == worker && occupied.is_live())
        });
        // Workers whose spawn failed report an exit without ever owning a slot.
        let Some(slot) = position.and_then(|index| self.slot_mut(index)) else {
            debug!(
                target: POOL_TARGET,
                %worker,
                "exit reported for unknown worker"
            );
            return;
        };
        slot.channel = None;
        slot.state = SlotState::Terminated;
        let kind = slot.kind;
        let joined = slot.handle.take().map(WorkerHandle::join);
        self.live = self.live.saturating_sub(1);
        if let Some(Err(error)) = joined {
            warn!(
                target: POOL_TARGET,
                %worker,
                error = %error,
                "worker ended abnormally"
            );
        }
        debug!(
            target: POOL_TARGET,
            %worker,
            ?kind,
            live = self.live,
            "worker reaped"
        );
    }

    /// Stores `slot` in the first free or terminated position.
    fn install(&mut self, slot: WorkerSlot<S::Handle>) -> usize {
        self.live += 1;
        let vacant = self
            .slots
            .iter()
            .position(|entry| entry.as_ref().is_none_or(|occupied| !occupied.is_live()));
        match vacant.and_then(|index| self.slots.get_mut(index).map(|entry| (index, entry))) {
            Some((index, entry)) => {
                *entry = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn allocate_worker(&mut self) -> WorkerId {
        let worker = WorkerId::new(self.next_worker);
        self.next_worker += 1;
        worker
    }

    fn notice(&self, worker: WorkerId) -> ExitNotice {
        ExitNotice::new(worker, self.events_tx.clone(), self.waker.clone())
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut WorkerSlot<S::Handle>> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    fn channel_at(&self, index: usize) -> Option<&DescriptorChannel> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .and_then(|slot| slot.channel.as_ref())
    }

    fn log_outcome(&self, outcome: Dispatch, peer: SocketAddr) {
        let live = self.live;
        let max = self.limits.max();
        match outcome {
            Dispatch::HandedOff { worker } => info!(
                target: POOL_TARGET,
                outcome = "handed_off",
                %peer,
                %worker,
                live,
                max,
                "connection handed off"
            ),
            Dispatch::Spawned { worker } => info!(
                target: POOL_TARGET,
                outcome = "spawned",
                %peer,
                %worker,
                live,
                max,
                "connection given to transient worker"
            ),
            Dispatch::Dropped(reason) => warn!(
                target: POOL_TARGET,
                outcome = "dropped",
                %peer,
                ?reason,
                live,
                max,
                "connection dropped"
            ),
        }
    }
}
