//! Plaintext strategy: non-blocking socket calls gated by `poll`.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;

use crate::error::{Operation, TransportError};
use crate::wait::{Deadline, Direction, retry_interrupted, wait_until};

pub(super) fn read(
    stream: &TcpStream,
    buf: &mut [u8],
    deadline: Deadline,
) -> Result<usize, TransportError> {
    loop {
        wait_until(stream.as_fd(), Direction::Readable, deadline, Operation::Read)?;
        let mut reader = stream;
        match retry_interrupted(|| reader.read(buf)) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(count) => return Ok(count),
            // Readiness can be spurious; wait again within the same window.
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(source) => return Err(TransportError::system(Operation::Read, source)),
        }
    }
}

pub(super) fn write(
    stream: &TcpStream,
    buf: &[u8],
    deadline: Deadline,
) -> Result<usize, TransportError> {
    loop {
        wait_until(stream.as_fd(), Direction::Writable, deadline, Operation::Write)?;
        let mut writer = stream;
        match retry_interrupted(|| writer.write(buf)) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(count) => return Ok(count),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(source) => return Err(TransportError::system(Operation::Write, source)),
        }
    }
}
