//! Descriptor channel: one byte, optionally carrying one descriptor.
//!
//! Both the readiness announcement and the connection handoff use the same
//! wire contract over a connected `socketpair`. A handoff is a single
//! `sendmsg` carrying one dummy byte and one `SCM_RIGHTS` descriptor, so
//! the descriptor either arrives whole or not at all.

use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::net::Shutdown;
use std::time::Duration;

use tracing::debug;

use crate::error::{Operation, TransportError};
use crate::wait::{Deadline, Direction, retry_interrupted, wait_until};

const CHANNEL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::channel");
const TOKEN: u8 = 0;
/// Room for a few descriptors so surplus ones are seen (and closed) rather
/// than truncated.
const CONTROL_WORDS: usize = 8;

/// One endpoint of a connected descriptor channel.
#[derive(Debug)]
pub struct DescriptorChannel {
    stream: UnixStream,
}

impl DescriptorChannel {
    /// Creates a connected pair of endpoints, one for each side.
    pub fn pair() -> Result<(Self, Self), TransportError> {
        let (left, right) =
            UnixStream::pair().map_err(|source| TransportError::system(Operation::Pair, source))?;
        for stream in [&left, &right] {
            stream
                .set_nonblocking(true)
                .map_err(|source| TransportError::system(Operation::Pair, source))?;
        }
        Ok((Self { stream: left }, Self { stream: right }))
    }

    /// Transmits `fd` alongside one payload byte once the channel is
    /// writable. The caller keeps its own copy of `fd` and must close it.
    pub fn send_descriptor(
        &self,
        fd: BorrowedFd<'_>,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let deadline = Deadline::after(timeout);
        loop {
            wait_until(self.as_fd(), Direction::Writable, deadline, Operation::Send)?;
            match send_with_rights(self.stream.as_raw_fd(), Some(fd.as_raw_fd())) {
                Ok(()) => {
                    debug!(target: CHANNEL_TARGET, fd = fd.as_raw_fd(), "descriptor sent");
                    return Ok(());
                }
                Err(error) if is_retryable(&error) => {}
                Err(source) => return Err(TransportError::system(Operation::Send, source)),
            }
        }
    }

    /// Receives one message and extracts its single descriptor.
    ///
    /// A message without a descriptor (or with more than one) is a protocol
    /// error; any descriptors that did arrive are closed.
    pub fn receive_descriptor(&self, timeout: Option<Duration>) -> Result<OwnedFd, TransportError> {
        let deadline = Deadline::after(timeout);
        loop {
            wait_until(self.as_fd(), Direction::Readable, deadline, Operation::Receive)?;
            match receive_with_rights(self.stream.as_raw_fd()) {
                Ok(Received::Closed) => return Err(TransportError::ConnectionClosed),
                Ok(Received::Truncated) => {
                    return Err(TransportError::Protocol {
                        reason: "ancillary data was truncated",
                    });
                }
                Ok(Received::Descriptors(mut fds)) => {
                    if fds.len() > 1 {
                        return Err(TransportError::Protocol {
                            reason: "handoff carried more than one descriptor",
                        });
                    }
                    return fds.pop().ok_or(TransportError::Protocol {
                        reason: "handoff carried no descriptor",
                    });
                }
                Err(error) if is_retryable(&error) => {}
                Err(source) => return Err(TransportError::system(Operation::Receive, source)),
            }
        }
    }

    /// Sends one byte with no descriptor to signal readiness.
    pub fn announce_ready(&self) -> Result<(), TransportError> {
        loop {
            wait_until(self.as_fd(), Direction::Writable, Deadline::never(), Operation::Send)?;
            match send_with_rights(self.stream.as_raw_fd(), None) {
                Ok(()) => return Ok(()),
                Err(error) if is_retryable(&error) => {}
                Err(source) => return Err(TransportError::system(Operation::Send, source)),
            }
        }
    }

    /// Consumes one pending readiness byte without waiting.
    ///
    /// Returns `Timeout` when no byte is pending and `ConnectionClosed` when
    /// the peer endpoint has gone away.
    pub fn drain_ready(&self) -> Result<(), TransportError> {
        let mut byte = [0_u8; 1];
        let mut stream = &self.stream;
        match retry_interrupted(|| stream.read(&mut byte)) {
            Ok(0) => Err(TransportError::ConnectionClosed),
            Ok(_) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Err(TransportError::Timeout {
                operation: Operation::Receive,
            }),
            Err(source) => Err(TransportError::system(Operation::Receive, source)),
        }
    }

    /// Shuts both directions down so the peer observes end of stream even
    /// while other copies of this endpoint remain open.
    pub fn shutdown(&self) -> Result<(), TransportError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(source) => Err(TransportError::system(Operation::Shutdown, source)),
        }
    }
}

impl AsFd for DescriptorChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn is_retryable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

fn fd_space() -> io::Result<libc::c_uint> {
    libc::c_uint::try_from(mem::size_of::<RawFd>()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor width exceeds the control length type",
        )
    })
}

fn send_with_rights(socket: RawFd, fd: Option<RawFd>) -> io::Result<()> {
    let token = [TOKEN];
    let mut iov = libc::iovec {
        iov_base: token.as_ptr() as *mut libc::c_void,
        iov_len: token.len(),
    };
    let mut control = [0_u64; CONTROL_WORDS];

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;

    if let Some(raw) = fd {
        let width = fd_space()?;
        // SAFETY: CMSG_SPACE is a pure size computation.
        let space = unsafe { libc::CMSG_SPACE(width) } as usize;
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = space as _;
        // SAFETY: the control buffer is aligned, zeroed and at least
        // CMSG_SPACE bytes long, so the first header fits.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msghdr);
            if cmsg.is_null() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "control buffer too small for SCM_RIGHTS",
                ));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(width) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), raw);
        }
    }

    // SAFETY: msghdr points at live iov/control buffers for the call.
    let sent = unsafe { libc::sendmsg(socket, &msghdr, SEND_FLAGS) };
    match sent {
        n if n < 0 => Err(io::Error::last_os_error()),
        0 => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "sendmsg transferred no payload",
        )),
        _ => Ok(()),
    }
}

enum Received {
    Closed,
    Truncated,
    Descriptors(Vec<OwnedFd>),
}

fn receive_with_rights(socket: RawFd) -> io::Result<Received> {
    let mut token = [0_u8; 1];
    let mut iov = libc::iovec {
        iov_base: token.as_mut_ptr().cast(),
        iov_len: token.len(),
    };
    let mut control = [0_u64; CONTROL_WORDS];

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = mem::size_of_val(&control) as _;

    // SAFETY: msghdr points at live iov/control buffers for the call.
    let received = unsafe { libc::recvmsg(socket, &mut msghdr, RECV_FLAGS) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    let fds = collect_descriptors(&msghdr);
    if received == 0 && fds.is_empty() {
        return Ok(Received::Closed);
    }
    if (msghdr.msg_flags & libc::MSG_CTRUNC) != 0 {
        drop(fds);
        return Ok(Received::Truncated);
    }
    Ok(Received::Descriptors(fds))
}

fn collect_descriptors(msghdr: &libc::msghdr) -> Vec<OwnedFd> {
    let mut out = Vec::new();
    // SAFETY: msghdr describes the control buffer filled by recvmsg.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let total = (*cmsg).cmsg_len as usize;
                let header = libc::CMSG_LEN(0) as usize;
                let count = total.saturating_sub(header) / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for index in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(index));
                    // SAFETY: descriptors delivered via SCM_RIGHTS belong to
                    // this process from here on.
                    out.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}
