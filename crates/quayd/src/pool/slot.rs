//! Slot-table records for live and exited workers.

use std::fmt;

use quay_transport::DescriptorChannel;

/// Identity of one worker for the lifetime of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a worker was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Spawned at start-up; serves connections handed over its channel.
    Resident,
    /// Spawned for one accepted connection; exits after serving it.
    Transient,
}

/// Observed state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Serving a connection, or starting up and yet to announce.
    Executing,
    /// Seen announcing readiness in the latest scan.
    Idle,
    /// The worker exited and its channel has been closed.
    Terminated,
}

#[derive(Debug)]
pub(super) struct WorkerSlot<H> {
    pub(super) worker: WorkerId,
    pub(super) kind: WorkerKind,
    pub(super) state: SlotState,
    pub(super) channel: Option<DescriptorChannel>,
    /// Set after a failed exchange; the slot is never selected again.
    pub(super) retired: bool,
    pub(super) handle: Option<H>,
}

impl<H> WorkerSlot<H> {
    pub(super) const fn is_live(&self) -> bool {
        !matches!(self.state, SlotState::Terminated)
    }

    pub(super) const fn is_selectable(&self) -> bool {
        self.is_live() && !self.retired && self.channel.is_some()
    }

    pub(super) fn view(&self, index: usize) -> SlotView {
        SlotView {
            index,
            worker: self.worker,
            kind: self.kind,
            state: self.state,
            has_channel: self.channel.is_some(),
            retired: self.retired,
        }
    }
}

/// Read-only copy of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    /// Position in the slot table.
    pub index: usize,
    /// Worker occupying the slot.
    pub worker: WorkerId,
    /// Launch kind.
    pub kind: WorkerKind,
    /// Current state.
    pub state: SlotState,
    /// Whether the daemon still holds a channel to the worker.
    pub has_channel: bool,
    /// Whether the slot is excluded from selection.
    pub retired: bool,
}
