//! Secure strategy: a rustls connection driven over a non-blocking socket.
//!
//! Every operation is a step function retried by [`drive`]. A step reports
//! which direction it is blocked on, and that direction is the one waited
//! for. A TLS write can need the socket to become readable (mid-handshake
//! traffic) and a TLS read can need it writable (pending records to flush).

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd};

use rustls::Connection;
use tracing::trace;

use crate::error::{Operation, TransportError};
use crate::wait::{Deadline, Direction, retry_interrupted, wait_until};

/// Outcome of one attempt at a TLS operation.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Step<T> {
    Done(T),
    /// Progress was made; try again straight away.
    Retry,
    Blocked(Direction),
}

/// Wait bounds per readiness direction.
#[derive(Debug, Clone, Copy)]
pub(super) struct Deadlines {
    pub(super) readable: Deadline,
    pub(super) writable: Deadline,
}

impl Deadlines {
    pub(super) const fn uniform(deadline: Deadline) -> Self {
        Self {
            readable: deadline,
            writable: deadline,
        }
    }

    const fn for_direction(self, direction: Direction) -> Deadline {
        match direction {
            Direction::Readable => self.readable,
            Direction::Writable => self.writable,
        }
    }
}

pub(super) fn drive<T>(
    fd: BorrowedFd<'_>,
    deadlines: Deadlines,
    operation: Operation,
    mut step: impl FnMut() -> Result<Step<T>, TransportError>,
) -> Result<T, TransportError> {
    loop {
        match step()? {
            Step::Done(value) => return Ok(value),
            Step::Retry => {}
            Step::Blocked(direction) => {
                wait_until(fd, direction, deadlines.for_direction(direction), operation)?;
            }
        }
    }
}

pub(super) fn handshake(
    connection: &mut Connection,
    stream: &TcpStream,
    deadlines: Deadlines,
) -> Result<(), TransportError> {
    drive(stream.as_fd(), deadlines, Operation::Handshake, || {
        if connection.wants_write() {
            return flush(connection, stream, Operation::Handshake);
        }
        if connection.is_handshaking() {
            return fill(connection, stream, Operation::Handshake);
        }
        Ok(Step::Done(()))
    })
}

pub(super) fn read(
    connection: &mut Connection,
    stream: &TcpStream,
    buf: &mut [u8],
    deadlines: Deadlines,
) -> Result<usize, TransportError> {
    drive(stream.as_fd(), deadlines, Operation::Read, || {
        match connection.reader().read(buf) {
            // A zero-length read after close_notify is a clean close.
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(count) => return Ok(Step::Done(count)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionClosed);
            }
            Err(source) => return Err(TransportError::system(Operation::Read, source)),
        }
        if connection.wants_write() {
            return flush(connection, stream, Operation::Read);
        }
        fill(connection, stream, Operation::Read)
    })
}

pub(super) fn write(
    connection: &mut Connection,
    stream: &TcpStream,
    buf: &[u8],
    deadlines: Deadlines,
) -> Result<usize, TransportError> {
    let mut accepted = None;
    let outcome = drive(stream.as_fd(), deadlines, Operation::Write, || {
        if connection.wants_write() {
            return flush(connection, stream, Operation::Write);
        }
        if let Some(count) = accepted {
            return Ok(Step::Done(count));
        }
        if connection.is_handshaking() {
            return fill(connection, stream, Operation::Write);
        }
        let count = connection
            .writer()
            .write(buf)
            .map_err(|source| TransportError::system(Operation::Write, source))?;
        if count == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        accepted = Some(count);
        Ok(Step::Retry)
    });
    // Plaintext handed to rustls is committed: its records go out ahead of
    // the next write, so the caller must not be told to send it again.
    match (outcome, accepted) {
        (Err(TransportError::Timeout { .. }), Some(count)) => {
            trace!(
                target: super::SESSION_TARGET,
                count,
                "write accepted; records left queued at deadline"
            );
            Ok(count)
        }
        (other, _) => other,
    }
}

pub(super) fn close_notify(
    connection: &mut Connection,
    stream: &TcpStream,
    deadlines: Deadlines,
) -> Result<(), TransportError> {
    connection.send_close_notify();
    drive(stream.as_fd(), deadlines, Operation::Shutdown, || {
        if connection.wants_write() {
            flush(connection, stream, Operation::Shutdown)
        } else {
            Ok(Step::Done(()))
        }
    })
}

fn flush<T>(
    connection: &mut Connection,
    stream: &TcpStream,
    operation: Operation,
) -> Result<Step<T>, TransportError> {
    let mut writer = stream;
    match retry_interrupted(|| connection.write_tls(&mut writer)) {
        Ok(_) => Ok(Step::Retry),
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
            Ok(Step::Blocked(Direction::Writable))
        }
        Err(source) => Err(TransportError::system(operation, source)),
    }
}

fn fill<T>(
    connection: &mut Connection,
    stream: &TcpStream,
    operation: Operation,
) -> Result<Step<T>, TransportError> {
    let mut reader = stream;
    match retry_interrupted(|| connection.read_tls(&mut reader)) {
        Ok(0) => Err(TransportError::ConnectionClosed),
        Ok(_) => match connection.process_new_packets() {
            Ok(_) => Ok(Step::Retry),
            Err(source) => {
                // Best effort: deliver the alert describing the failure.
                let mut writer = stream;
                if connection.write_tls(&mut writer).is_err() {
                    trace!(target: super::SESSION_TARGET, "TLS alert could not be sent");
                }
                Err(TransportError::Tls { operation, source })
            }
        },
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
            Ok(Step::Blocked(Direction::Readable))
        }
        Err(source) => Err(TransportError::system(operation, source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn blocked_step_waits_for_the_requested_direction() {
        let (local, mut peer) = UnixStream::pair().expect("socket pair");
        let delay = Duration::from_millis(200);
        let writer = thread::spawn(move || {
            thread::sleep(delay);
            peer.write_all(b"x").expect("peer writes");
            peer
        });

        // The socket is writable from the start; only readability is late.
        let mut attempts = 0;
        let started = Instant::now();
        let sent = drive(
            local.as_fd(),
            Deadlines::uniform(Deadline::after(Some(Duration::from_secs(5)))),
            Operation::Write,
            || {
                attempts += 1;
                Ok(if attempts == 1 {
                    Step::Blocked(Direction::Readable)
                } else {
                    Step::Done(11_usize)
                })
            },
        )
        .expect("write completes");

        assert_eq!(sent, 11);
        assert_eq!(attempts, 2);
        assert!(
            started.elapsed() >= delay - Duration::from_millis(20),
            "retried before the socket became readable"
        );
        drop(writer.join().expect("join peer"));
    }

    #[test]
    fn blocked_step_honours_its_deadline() {
        let (local, _peer) = UnixStream::pair().expect("socket pair");
        let error = drive::<()>(
            local.as_fd(),
            Deadlines::uniform(Deadline::after(Some(Duration::from_millis(80)))),
            Operation::Read,
            || Ok(Step::Blocked(Direction::Readable)),
        )
        .expect_err("peer never writes");
        assert!(matches!(
            error,
            TransportError::Timeout {
                operation: Operation::Read
            }
        ));
    }

    #[test]
    fn step_errors_stop_the_drive() {
        let (local, _peer) = UnixStream::pair().expect("socket pair");
        let error = drive::<()>(
            local.as_fd(),
            Deadlines::uniform(Deadline::never()),
            Operation::Read,
            || Err(TransportError::ConnectionClosed),
        )
        .expect_err("step failed");
        assert!(error.is_closed());
    }
}
