//! The daemon's listening socket.
//!
//! The socket is built with `socket2` so the options that must precede
//! `bind` (address reuse, dual-stack) and the accept backlog can be set
//! explicitly. Accepting is non-blocking; the dispatch loop waits for
//! readiness with `poll` and drains the queue on each wake-up.

mod errors;

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::info;

use quay_transport::retry_interrupted;

pub use errors::ListenerError;

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::listener");

/// A bound, listening TCP socket.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    local: SocketAddr,
}

impl Listener {
    /// Resolves `host`, binds the first address and starts listening.
    ///
    /// The IPv6 unspecified address is bound dual-stack so IPv4 clients
    /// are accepted as mapped addresses.
    pub fn bind(host: &str, port: u16, backlog: u32) -> Result<Self, ListenerError> {
        let addr = resolve(host, port)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| ListenerError::Socket { addr, source })?;
        socket
            .set_reuse_address(true)
            .map_err(|source| ListenerError::Socket { addr, source })?;
        if let SocketAddr::V6(v6) = addr
            && v6.ip().is_unspecified()
        {
            socket
                .set_only_v6(false)
                .map_err(|source| ListenerError::Socket { addr, source })?;
        }
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|source| ListenerError::BindTcp { addr, source })?;
        let queue = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket
            .listen(queue)
            .map_err(|source| ListenerError::Listen { addr, source })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| ListenerError::NonBlocking { source })?;
        let listener = TcpListener::from(socket);
        let local = listener
            .local_addr()
            .map_err(|source| ListenerError::Socket { addr, source })?;
        info!(
            target: LISTENER_TARGET,
            addr = %local,
            backlog,
            "listening"
        );
        Ok(Self {
            socket: listener,
            local,
        })
    }

    /// Accepts one pending connection, or `None` when the queue is empty.
    pub fn accept(&self) -> Result<Option<(TcpStream, SocketAddr)>, ListenerError> {
        match retry_interrupted(|| self.socket.accept()) {
            Ok(accepted) => Ok(Some(accepted)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // The peer gave up while queued; nothing to hand off.
            Err(error) if error.kind() == io::ErrorKind::ConnectionAborted => Ok(None),
            Err(source) => Err(ListenerError::Accept { source }),
        }
    }

    /// Address the listener is bound to, with the kernel-chosen port.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;
    addrs.next().ok_or_else(|| ListenerError::ResolveEmpty {
        host: host.to_owned(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use quay_transport::{Direction, Operation, wait_ready};

    #[test]
    fn empty_queue_yields_none() {
        let listener = Listener::bind("127.0.0.1", 0, 16).expect("bind");
        assert!(listener.accept().expect("accept").is_none());
    }

    #[test]
    fn pending_connections_are_accepted() {
        let listener = Listener::bind("127.0.0.1", 0, 16).expect("bind");
        let _client = TcpStream::connect(listener.local_addr()).expect("connect");
        wait_ready(
            listener.as_fd(),
            Direction::Readable,
            Some(Duration::from_secs(2)),
            Operation::Accept,
        )
        .expect("connection queued");
        let (_, peer) = listener.accept().expect("accept").expect("pending connection");
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn unspecified_ipv6_accepts_ipv4_clients() {
        let Ok(listener) = Listener::bind("::", 0, 16) else {
            // Hosts without IPv6 cannot exercise dual-stack binding.
            return;
        };
        let port = listener.local_addr().port();
        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
        assert!(client.is_ok(), "IPv4 client refused: {client:?}");
    }

    #[test]
    fn unresolvable_hosts_are_reported() {
        let error = Listener::bind("host.invalid", 0, 16).expect_err("cannot resolve");
        assert!(matches!(
            error,
            ListenerError::Resolve { .. } | ListenerError::ResolveEmpty { .. }
        ));
    }
}
