//! A pre-forked TCP connection daemon.
//!
//! The daemon binds one listening socket, keeps a set of resident worker
//! threads ready to serve, and grows transient workers on demand up to a
//! configured ceiling. A single dispatch loop accepts connections and hands
//! each accepted descriptor to an idle worker over a local descriptor
//! channel. Workers wrap the descriptor in a [`quay_transport::Session`],
//! perform the secure handshake when one is configured, and run the
//! configured [`ConnectionHandler`].
//!
//! Start-up follows the same sequence in every mode: load configuration,
//! take the runtime lock, optionally daemonise, install telemetry, open the
//! transport environment, bind, start the residents, and report readiness
//! through both [`HealthReporter`] and the on-disk health snapshot. A
//! termination signal drains the pool and removes the runtime artefacts.

mod bootstrap;
mod dispatch;
mod handler;
mod health;
mod listener;
mod pool;
mod process;
mod telemetry;
mod waker;
mod worker;

pub use bootstrap::{
    BootstrapError, ConfigLoader, Daemon, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use dispatch::{DispatchError, Dispatcher, DispatcherHandle, LoopExit, ShutdownHandle};
pub use handler::{ConnectionHandler, EchoHandler, HandlerError, HandlerFactory, HandlerRegistry};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use listener::{Listener, ListenerError};
pub use pool::{
    Dispatch, DropReason, ExitNotice, PoolError, SlotState, SlotView, WorkerEvent, WorkerHandle,
    WorkerId, WorkerKind, WorkerLaunch, WorkerPool, WorkerSpawner,
};
pub use process::{LaunchError, LaunchMode, run_daemon};
pub use telemetry::{TelemetryError, TelemetryHandle, prune_logs};
pub use waker::{WakeHandle, Waker};
pub use worker::{ThreadSpawner, ThreadWorker, WorkerContext};

#[cfg(test)]
mod tests;
