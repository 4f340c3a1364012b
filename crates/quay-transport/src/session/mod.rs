//! Transport sessions: timed, interruption-safe I/O over one connection.
//!
//! A session binds once, at construction, to either the plaintext or the
//! secure strategy and keeps that binding until it is closed. Both
//! strategies honour the same contract: a single `read`/`write` waits for
//! readiness and then performs one bounded transfer, while the `_exact`
//! variants loop until the whole buffer has moved.

mod plaintext;
mod secure;

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, Connection, ServerConnection};
use tracing::debug;

use crate::environment::{Environment, EnvironmentRole, SecureConfig, TlsContext};
use crate::error::{ConfigError, Operation, TransportError};
use crate::wait::{Deadline, Wait, timeout_from_seconds};

const SESSION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::session");

/// Largest transfer handed to one plaintext system call.
pub const PLAINTEXT_CHUNK: usize = i32::MAX as usize;
/// Largest transfer handed to one TLS record operation.
pub const SECURE_CHUNK: usize = 16 * 1024;

/// Default per-direction bounds; `None` waits without limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Bound for reads issued with [`Wait::UseDefault`].
    pub read: Option<Duration>,
    /// Bound for writes issued with [`Wait::UseDefault`].
    pub write: Option<Duration>,
    /// Bound for establishing outbound connections.
    pub connect: Option<Duration>,
}

impl SessionTimeouts {
    /// Every direction waits without limit.
    pub const UNBOUNDED: Self = Self {
        read: None,
        write: None,
        connect: None,
    };

    /// Builds bounds from whole seconds; negative values are unbounded.
    #[must_use]
    pub const fn from_seconds(read: i64, write: i64, connect: i64) -> Self {
        Self {
            read: timeout_from_seconds(read),
            write: timeout_from_seconds(write),
            connect: timeout_from_seconds(connect),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from_seconds(20, 20, 20)
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Default bounds for each direction.
    pub timeouts: SessionTimeouts,
    /// Secure parameters for a session-local environment, used only when no
    /// shared environment is supplied.
    pub secure: Option<SecureConfig>,
}

#[derive(Debug)]
enum EnvironmentRef {
    Shared(Arc<Environment>),
    Local(Environment),
}

impl EnvironmentRef {
    fn resolve(
        shared: Option<Arc<Environment>>,
        config: Option<&SessionConfig>,
    ) -> Result<Self, TransportError> {
        match shared {
            Some(environment) => Ok(Self::Shared(environment)),
            None => {
                let secure = config.and_then(|settings| settings.secure.as_ref());
                Ok(Self::Local(Environment::open(secure)?))
            }
        }
    }

    fn get(&self) -> &Environment {
        match self {
            Self::Shared(environment) => environment,
            Self::Local(environment) => environment,
        }
    }

    const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

#[derive(Debug)]
enum Strategy {
    Plaintext,
    Secure(Box<Connection>),
}

#[derive(Debug)]
struct Open {
    stream: TcpStream,
    strategy: Strategy,
    environment: EnvironmentRef,
}

/// One connection plus its I/O strategy and default timeouts.
#[derive(Debug)]
pub struct Session {
    open: Option<Open>,
    timeouts: SessionTimeouts,
    peer: Option<SocketAddr>,
    secure: bool,
}

impl Session {
    /// Adopts an accepted connection.
    ///
    /// Without a shared environment the session opens a local one from
    /// `config`. A secure session completes the server handshake before
    /// returning; the handshake is bounded by the read and write timeouts.
    /// Without `config` the session waits without limit by default.
    pub fn accept(
        stream: TcpStream,
        environment: Option<Arc<Environment>>,
        config: Option<&SessionConfig>,
    ) -> Result<Self, TransportError> {
        let timeouts = config.map_or(SessionTimeouts::UNBOUNDED, |settings| settings.timeouts);
        let environment = EnvironmentRef::resolve(environment, config)?;
        let strategy = match environment.get().tls() {
            None => Strategy::Plaintext,
            Some(TlsContext::Acceptor(server)) => {
                let connection = ServerConnection::new(Arc::clone(server)).map_err(|source| {
                    TransportError::Tls {
                        operation: Operation::Handshake,
                        source,
                    }
                })?;
                Strategy::Secure(Box::new(Connection::Server(connection)))
            }
            Some(TlsContext::Initiator(_)) => {
                return Err(ConfigError::RoleMismatch {
                    role: EnvironmentRole::Initiator.as_str(),
                    direction: "accept",
                }
                .into());
            }
        };
        Self::establish(stream, strategy, environment, timeouts, Operation::Accept)
    }

    /// Opens an outbound connection to `host:port`.
    ///
    /// Every resolved address is tried in turn, each bounded by the connect
    /// timeout. A secure session sends `host` as the server name and
    /// completes the client handshake before returning.
    pub fn connect(
        host: &str,
        port: u16,
        environment: Option<Arc<Environment>>,
        config: Option<&SessionConfig>,
    ) -> Result<Self, TransportError> {
        let timeouts = config.map_or(SessionTimeouts::UNBOUNDED, |settings| settings.timeouts);
        let environment = EnvironmentRef::resolve(environment, config)?;
        let strategy = match environment.get().tls() {
            None => Strategy::Plaintext,
            Some(TlsContext::Initiator(client)) => {
                let name = ServerName::try_from(host.to_owned()).map_err(|_| {
                    ConfigError::InvalidServerName {
                        host: host.to_owned(),
                    }
                })?;
                let connection =
                    ClientConnection::new(Arc::clone(client), name).map_err(|source| {
                        TransportError::Tls {
                            operation: Operation::Handshake,
                            source,
                        }
                    })?;
                Strategy::Secure(Box::new(Connection::Client(connection)))
            }
            Some(TlsContext::Acceptor(_)) => {
                return Err(ConfigError::RoleMismatch {
                    role: EnvironmentRole::Acceptor.as_str(),
                    direction: "initiate",
                }
                .into());
            }
        };
        let stream = dial(host, port, timeouts.connect)?;
        Self::establish(stream, strategy, environment, timeouts, Operation::Connect)
    }

    fn establish(
        stream: TcpStream,
        mut strategy: Strategy,
        environment: EnvironmentRef,
        timeouts: SessionTimeouts,
        operation: Operation,
    ) -> Result<Self, TransportError> {
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::system(operation, source))?;
        let peer = stream.peer_addr().ok().map(canonical_peer);
        if let Strategy::Secure(connection) = &mut strategy {
            let deadlines = secure::Deadlines {
                readable: Deadline::after(timeouts.read),
                writable: Deadline::after(timeouts.write),
            };
            if let Err(error) = secure::handshake(connection, &stream, deadlines) {
                debug!(
                    target: SESSION_TARGET,
                    peer = ?peer,
                    error = %error,
                    "handshake failed"
                );
                discard(&stream);
                return Err(error);
            }
        }
        let secure = matches!(strategy, Strategy::Secure(_));
        debug!(target: SESSION_TARGET, peer = ?peer, secure, "session established");
        Ok(Self {
            open: Some(Open {
                stream,
                strategy,
                environment,
            }),
            timeouts,
            peer,
            secure,
        })
    }

    /// Waits for readability, then performs one read of at most
    /// `buf.len()` bytes.
    ///
    /// Returns `ConnectionClosed` when the peer has finished sending.
    pub fn read(&mut self, buf: &mut [u8], wait: Wait) -> Result<usize, TransportError> {
        let deadline = Deadline::after(wait.resolve(self.timeouts.read));
        let open = self.open_mut()?;
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut open.strategy {
            Strategy::Plaintext => {
                plaintext::read(&open.stream, capped(buf, PLAINTEXT_CHUNK), deadline)
            }
            Strategy::Secure(connection) => secure::read(
                connection,
                &open.stream,
                capped(buf, SECURE_CHUNK),
                secure::Deadlines::uniform(deadline),
            ),
        }
    }

    /// Fills `buf` completely, or fails.
    ///
    /// Each underlying read gets its own `wait` bound. On failure the
    /// contents of `buf` are unspecified and must not be treated as a
    /// partial record.
    pub fn read_exact(&mut self, buf: &mut [u8], wait: Wait) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let (_, rest) = buf.split_at_mut(filled);
            filled += self.read(rest, wait)?;
        }
        Ok(filled)
    }

    /// Waits for writability, then performs one write of at most
    /// `buf.len()` bytes.
    pub fn write(&mut self, buf: &[u8], wait: Wait) -> Result<usize, TransportError> {
        let deadline = Deadline::after(wait.resolve(self.timeouts.write));
        let open = self.open_mut()?;
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut open.strategy {
            Strategy::Plaintext => {
                plaintext::write(&open.stream, capped_ref(buf, PLAINTEXT_CHUNK), deadline)
            }
            Strategy::Secure(connection) => secure::write(
                connection,
                &open.stream,
                capped_ref(buf, SECURE_CHUNK),
                secure::Deadlines::uniform(deadline),
            ),
        }
    }

    /// Sends all of `buf`, or fails. Each underlying write gets its own
    /// `wait` bound.
    pub fn write_exact(&mut self, buf: &[u8], wait: Wait) -> Result<usize, TransportError> {
        let mut sent = 0;
        while sent < buf.len() {
            let (_, rest) = buf.split_at(sent);
            sent += self.write(rest, wait)?;
        }
        Ok(sent)
    }

    /// Shuts TLS down (when secure), closes the connection and releases a
    /// local environment.
    ///
    /// A second close returns `InvalidState`.
    pub fn close(&mut self) -> Result<(), TransportError> {
        let open = self
            .open
            .take()
            .ok_or(TransportError::InvalidState("session is already closed"))?;
        let Open {
            stream,
            mut strategy,
            environment,
        } = open;
        if let Strategy::Secure(connection) = &mut strategy {
            let deadlines = secure::Deadlines::uniform(Deadline::after(self.timeouts.write));
            if let Err(error) = secure::close_notify(connection, &stream, deadlines) {
                debug!(
                    target: SESSION_TARGET,
                    peer = ?self.peer,
                    error = %error,
                    "close_notify not delivered"
                );
            }
        }
        discard(&stream);
        debug!(
            target: SESSION_TARGET,
            peer = ?self.peer,
            local_environment = environment.is_local(),
            "session closed"
        );
        Ok(())
    }

    /// Whether this session runs the secure strategy.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether [`Session::close`] has not yet run.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Remote address, with IPv4-mapped addresses shown as IPv4.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Default bounds applied to [`Wait::UseDefault`].
    #[must_use]
    pub const fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    /// Replaces the default bounds.
    pub const fn set_timeouts(&mut self, timeouts: SessionTimeouts) {
        self.timeouts = timeouts;
    }

    fn open_mut(&mut self) -> Result<&mut Open, TransportError> {
        self.open
            .as_mut()
            .ok_or(TransportError::InvalidState("session is closed"))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.open.is_some() && self.close().is_err() {
            debug!(target: SESSION_TARGET, "session close on drop failed");
        }
    }
}

fn dial(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream, TransportError> {
    let addresses = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::system(Operation::Connect, source))?;
    let mut last_error = None;
    for address in addresses {
        let attempt = match timeout {
            None => TcpStream::connect(address),
            Some(limit) if limit.is_zero() => {
                return Err(TransportError::Timeout {
                    operation: Operation::Connect,
                });
            }
            Some(limit) => TcpStream::connect_timeout(&address, limit),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!(
                    target: SESSION_TARGET,
                    %address,
                    error = %error,
                    "connect attempt failed"
                );
                last_error = Some(error);
            }
        }
    }
    Err(match last_error {
        Some(error) if error.kind() == io::ErrorKind::TimedOut => TransportError::Timeout {
            operation: Operation::Connect,
        },
        Some(error) => TransportError::system(Operation::Connect, error),
        None => TransportError::system(
            Operation::Connect,
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("'{host}' resolved to no addresses"),
            ),
        ),
    })
}

fn canonical_peer(address: SocketAddr) -> SocketAddr {
    match address {
        SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map_or(address, |v4| {
            SocketAddr::new(v4.into(), v6.port())
        }),
        SocketAddr::V4(_) => address,
    }
}

fn discard(stream: &TcpStream) {
    match stream.shutdown(Shutdown::Both) {
        Err(error) if error.kind() != io::ErrorKind::NotConnected => {
            debug!(target: SESSION_TARGET, error = %error, "socket shutdown failed");
        }
        _ => {}
    }
}

fn capped(buf: &mut [u8], limit: usize) -> &mut [u8] {
    let len = buf.len().min(limit);
    buf.split_at_mut(len).0
}

fn capped_ref(buf: &[u8], limit: usize) -> &[u8] {
    let len = buf.len().min(limit);
    buf.split_at(len).0
}

#[cfg(test)]
mod tests;
