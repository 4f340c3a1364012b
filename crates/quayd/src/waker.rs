//! Self-pipe used to interrupt the dispatch loop's `poll`.
//!
//! Worker exit notices and shutdown requests write one byte to the waker;
//! the dispatch loop polls the read end next to the listener and drains it
//! before applying pending events.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use quay_transport::retry_interrupted;

/// Read end of the self-pipe, owned by the dispatch loop.
#[derive(Debug)]
pub struct Waker {
    reader: UnixStream,
    handle: WakeHandle,
}

/// Cloneable write end of the self-pipe.
#[derive(Debug, Clone)]
pub struct WakeHandle {
    writer: Arc<UnixStream>,
}

impl Waker {
    /// Creates a non-blocking waker pair.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            handle: WakeHandle {
                writer: Arc::new(writer),
            },
        })
    }

    /// Returns a handle that wakes this waker.
    #[must_use]
    pub fn handle(&self) -> WakeHandle {
        self.handle.clone()
    }

    /// Consumes every pending wake byte.
    pub fn drain(&self) -> io::Result<()> {
        let mut buffer = [0_u8; 64];
        let mut reader = &self.reader;
        loop {
            match retry_interrupted(|| reader.read(&mut buffer)) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }
}

impl AsFd for Waker {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl WakeHandle {
    /// Makes the waker readable.
    ///
    /// A full socket buffer already guarantees a pending wake-up, so
    /// `WouldBlock` is not an error. Other failures mean the loop is gone.
    pub fn wake(&self) {
        let mut writer = self.writer.as_ref();
        match retry_interrupted(|| writer.write(&[1])) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => {
                tracing::debug!(
                    target: crate::dispatch::DISPATCH_TARGET,
                    error = %error,
                    "wake-up not delivered"
                );
            }
        }
    }
}
