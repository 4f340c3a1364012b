//! Readiness waits and the interrupted-call retry combinator.
//!
//! Every blocking point in the transport layer is a `poll(2)` bounded by a
//! [`Deadline`]. Interrupted polls resume with whatever time remains, so a
//! signal never stretches a bound and never surfaces to the caller.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use crate::error::{Operation, TransportError};

/// Per-call timeout, expressed the way callers pass whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Use the session's configured timeout for this direction.
    UseDefault,
    /// Wait at most this long; zero polls without waiting.
    Bounded(Duration),
    /// Wait with no time bound.
    Indefinite,
}

impl Wait {
    /// Poll once without waiting.
    pub const IMMEDIATE: Self = Self::Bounded(Duration::ZERO);

    /// Interprets a whole-second timeout: `-1` selects the configured
    /// default, any other negative value is unbounded.
    #[must_use]
    pub const fn from_seconds(seconds: i64) -> Self {
        match seconds {
            -1 => Self::UseDefault,
            s if s < 0 => Self::Indefinite,
            s => Self::Bounded(Duration::from_secs(s.unsigned_abs())),
        }
    }

    /// Resolves against a session default, where `None` is unbounded.
    #[must_use]
    pub const fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::UseDefault => default,
            Self::Bounded(limit) => Some(limit),
            Self::Indefinite => None,
        }
    }
}

impl From<Duration> for Wait {
    fn from(limit: Duration) -> Self {
        Self::Bounded(limit)
    }
}

/// Converts a configured whole-second default into a bound; negative
/// values are unbounded.
#[must_use]
pub const fn timeout_from_seconds(seconds: i64) -> Option<Duration> {
    if seconds < 0 {
        None
    } else {
        Some(Duration::from_secs(seconds.unsigned_abs()))
    }
}

/// Readiness direction awaited on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Data (or end of stream) is available to read.
    Readable,
    /// Buffer space is available to write.
    Writable,
}

impl Direction {
    const fn events(self) -> libc::c_short {
        match self {
            Self::Readable => libc::POLLIN,
            Self::Writable => libc::POLLOUT,
        }
    }
}

/// Absolute end of a wait window; `None` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.and_then(|limit| Instant::now().checked_add(limit)))
    }

    /// A deadline that never expires.
    #[must_use]
    pub const fn never() -> Self {
        Self(None)
    }

    /// Time left before expiry; `None` when unbounded.
    #[must_use]
    pub fn remaining(self) -> Option<Duration> {
        self.0
            .map(|end| end.saturating_duration_since(Instant::now()))
    }

    /// Whether the window has closed.
    #[must_use]
    pub fn expired(self) -> bool {
        self.0.is_some_and(|end| Instant::now() >= end)
    }
}

/// Repeats `operation` until it yields something other than `EINTR`.
pub fn retry_interrupted<T>(mut operation: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match operation() {
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            result => return result,
        }
    }
}

/// Blocks until `fd` is ready in `direction` or `deadline` passes.
///
/// Error and hang-up conditions count as ready; the operation that follows
/// reports them.
pub fn wait_until(
    fd: BorrowedFd<'_>,
    direction: Direction,
    deadline: Deadline,
    operation: Operation,
) -> Result<(), TransportError> {
    let ready = poll_until(&[fd], direction, deadline)?;
    if ready.first().copied().unwrap_or(false) {
        Ok(())
    } else {
        Err(TransportError::Timeout { operation })
    }
}

/// Convenience wrapper over [`wait_until`] taking a relative timeout.
pub fn wait_ready(
    fd: BorrowedFd<'_>,
    direction: Direction,
    timeout: Option<Duration>,
    operation: Operation,
) -> Result<(), TransportError> {
    wait_until(fd, direction, Deadline::after(timeout), operation)
}

/// Polls `fds` for `direction` until at least one is ready or the deadline
/// passes, returning per-descriptor readiness (all false on timeout).
pub fn poll_until(
    fds: &[BorrowedFd<'_>],
    direction: Direction,
    deadline: Deadline,
) -> Result<Vec<bool>, TransportError> {
    let mut entries: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.as_raw_fd(),
            events: direction.events(),
            revents: 0,
        })
        .collect();
    let count = libc::nfds_t::try_from(entries.len()).map_err(|_| {
        TransportError::system(
            Operation::Wait,
            io::Error::new(io::ErrorKind::InvalidInput, "too many descriptors to poll"),
        )
    })?;
    loop {
        let timeout = poll_timeout(deadline.remaining());
        // SAFETY: `entries` is a live, correctly sized pollfd array.
        let rc = unsafe { libc::poll(entries.as_mut_ptr(), count, timeout) };
        if rc < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(TransportError::system(Operation::Wait, error));
        }
        if rc > 0 {
            return Ok(entries.iter().map(|entry| entry.revents != 0).collect());
        }
        if deadline.remaining().is_some_and(|left| left.is_zero()) {
            return Ok(vec![false; entries.len()]);
        }
    }
}

fn poll_timeout(remaining: Option<Duration>) -> libc::c_int {
    let Some(left) = remaining else {
        return -1;
    };
    // Round sub-millisecond remainders up so short waits do not spin.
    let millis = left
        .as_millis()
        .saturating_add(u128::from(left.subsec_nanos() % 1_000_000 != 0));
    libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[rstest]
    #[case(-1, Wait::UseDefault)]
    #[case(-2, Wait::Indefinite)]
    #[case(-300, Wait::Indefinite)]
    #[case(0, Wait::IMMEDIATE)]
    #[case(7, Wait::Bounded(Duration::from_secs(7)))]
    fn interprets_whole_seconds(#[case] seconds: i64, #[case] expected: Wait) {
        assert_eq!(Wait::from_seconds(seconds), expected);
    }

    #[test]
    fn default_resolution_prefers_the_session_value() {
        let default = Some(Duration::from_secs(20));
        assert_eq!(Wait::UseDefault.resolve(default), default);
        assert_eq!(Wait::UseDefault.resolve(None), None);
        assert_eq!(Wait::Indefinite.resolve(default), None);
        assert_eq!(
            Wait::from_seconds(3).resolve(default),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn retry_combinator_swallows_interruptions() {
        let mut attempts = 0;
        let result = retry_interrupted(|| {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.expect("third attempt succeeds"), 3);
    }

    #[test]
    fn retry_combinator_surfaces_other_errors() {
        let result: io::Result<()> =
            retry_interrupted(|| Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert_eq!(
            result.expect_err("error surfaces").kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn idle_descriptor_times_out_within_the_bound() {
        let (left, _right) = UnixStream::pair().expect("socket pair");
        let bound = Duration::from_millis(150);
        let started = Instant::now();
        let error = wait_ready(left.as_fd(), Direction::Readable, Some(bound), Operation::Read)
            .expect_err("nothing to read");
        let elapsed = started.elapsed();
        assert!(error.is_timeout(), "expected timeout, got {error}");
        assert!(elapsed >= bound, "returned early after {elapsed:?}");
        assert!(elapsed < bound + Duration::from_secs(1), "overshot: {elapsed:?}");
    }

    #[test]
    fn zero_bound_polls_without_waiting() {
        let (left, _right) = UnixStream::pair().expect("socket pair");
        let started = Instant::now();
        let error = wait_ready(
            left.as_fd(),
            Direction::Readable,
            Some(Duration::ZERO),
            Operation::Read,
        )
        .expect_err("nothing to read");
        assert!(error.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn poll_reports_only_ready_descriptors() {
        let (a, mut a_peer) = UnixStream::pair().expect("first pair");
        let (b, _b_peer) = UnixStream::pair().expect("second pair");
        a_peer.write_all(&[1]).expect("write readiness byte");
        let ready = poll_until(
            &[a.as_fd(), b.as_fd()],
            Direction::Readable,
            Deadline::after(Some(Duration::ZERO)),
        )
        .expect("poll succeeds");
        assert_eq!(ready, vec![true, false]);
    }
}
