//! Connection plumbing shared by the quay daemon and its protocol handlers.
//!
//! The crate has three layers:
//!
//! - [`DescriptorChannel`] moves an open descriptor, or a bare readiness
//!   byte, across a connected `socketpair`. The daemon uses it to hand
//!   accepted connections to idle workers.
//! - [`Environment`] holds the TLS context for one handshake role. It is
//!   built once and then shared read-only between sessions.
//! - [`Session`] wraps one TCP connection and exposes timed `read`,
//!   `read_exact`, `write` and `write_exact` calls over either the plaintext
//!   or the secure strategy.
//!
//! Every wait is a `poll(2)` bounded by a deadline. Interrupted system calls
//! are retried where they happen and never reach the caller; the remaining
//! failures are described by [`TransportError`].

mod channel;
mod environment;
mod error;
mod session;
mod wait;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use channel::DescriptorChannel;
pub use environment::{Environment, EnvironmentRole, SecureConfig};
pub use error::{ConfigError, Operation, TransportError};
pub use session::{
    PLAINTEXT_CHUNK, SECURE_CHUNK, Session, SessionConfig, SessionTimeouts,
};
pub use wait::{
    Deadline, Direction, Wait, poll_until, retry_interrupted, timeout_from_seconds, wait_ready,
    wait_until,
};
