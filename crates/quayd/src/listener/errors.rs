//! Error types for the listening socket.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced while binding or accepting on the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The bind host did not resolve.
    #[error("failed to resolve TCP address {host}:{port}: {source}")]
    Resolve {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
        /// Resolver error.
        #[source]
        source: io::Error,
    },
    /// The bind host resolved to nothing.
    #[error("no TCP addresses resolved for {host}:{port}")]
    ResolveEmpty {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
    },
    /// Creating or configuring the socket failed.
    #[error("failed to prepare listening socket for {addr}: {source}")]
    Socket {
        /// Address being bound.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Binding the address failed.
    #[error("failed to bind TCP listener at {addr}: {source}")]
    BindTcp {
        /// Address being bound.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// `listen(2)` failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// Bound address.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Switching the listener to non-blocking mode failed.
    #[error("failed to enable non-blocking listener: {source}")]
    NonBlocking {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// `accept(2)` failed for a reason other than an empty queue.
    #[error("failed to accept connection: {source}")]
    Accept {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl ListenerError {
    /// Kind of the underlying OS error, when there is one.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Resolve { source, .. }
            | Self::Socket { source, .. }
            | Self::BindTcp { source, .. }
            | Self::Listen { source, .. }
            | Self::NonBlocking { source }
            | Self::Accept { source } => Some(source.kind()),
            Self::ResolveEmpty { .. } => None,
        }
    }
}
