//! Error taxonomy shared by channels, environments, and sessions.

use std::io;
use std::path::PathBuf;

use strum::Display;
use thiserror::Error;

/// Operation in progress when a transport error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Waiting for readiness.
    Wait,
    /// Reading from a session.
    Read,
    /// Writing to a session.
    Write,
    /// Establishing an outbound connection.
    Connect,
    /// Accepting an inbound connection.
    Accept,
    /// Completing a TLS handshake.
    Handshake,
    /// Sending over a descriptor channel.
    Send,
    /// Receiving over a descriptor channel.
    Receive,
    /// Creating a connected descriptor channel.
    #[strum(serialize = "socketpair")]
    Pair,
    /// Shutting a socket or channel down.
    Shutdown,
}

/// Errors surfaced by the transport layer.
///
/// Interrupted system calls never appear here; they are retried at the
/// point of interruption.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The wait bound elapsed before the descriptor became ready.
    #[error("timed out during {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: Operation,
    },
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// An underlying system call failed.
    #[error("{operation} failed: {source}")]
    System {
        /// Operation that failed.
        operation: Operation,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Secure or session configuration was malformed or incomplete.
    #[error("invalid transport configuration: {0}")]
    Config(#[from] ConfigError),
    /// A descriptor handoff message lacked its ancillary descriptor.
    #[error("descriptor handoff violated the channel protocol: {reason}")]
    Protocol {
        /// What was wrong with the message.
        reason: &'static str,
    },
    /// The TLS engine rejected the peer's traffic.
    #[error("TLS failure during {operation}: {source}")]
    Tls {
        /// Operation that failed.
        operation: Operation,
        /// Error reported by the TLS engine.
        #[source]
        source: rustls::Error,
    },
    /// The object was used in a state that does not permit the call.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl TransportError {
    /// Wraps an OS error raised by `operation`.
    #[must_use]
    pub fn system(operation: Operation, source: io::Error) -> Self {
        Self::System { operation, source }
    }

    /// Returns true for [`TransportError::Timeout`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for [`TransportError::ConnectionClosed`].
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Secure-transport configuration errors; fatal at start-up.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An acceptor was configured without a certificate chain.
    #[error("an acceptor requires a certificate")]
    MissingCertificate,
    /// An acceptor was configured without a private key.
    #[error("an acceptor requires a private key")]
    MissingPrivateKey,
    /// Peer validation was requested without any trust anchors.
    #[error("peer validation requires a trust file or directory")]
    MissingTrustStore,
    /// A configured file could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A PEM file could not be parsed.
    #[error("failed to parse PEM in '{path}': {source}")]
    Pem {
        /// Offending file.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: rustls_pki_types::pem::Error,
    },
    /// A certificate file held no certificates.
    #[error("no certificates found in '{path}'")]
    NoCertificates {
        /// Offending file.
        path: PathBuf,
    },
    /// A trust anchor was rejected.
    #[error("failed to add trust anchor from '{path}': {source}")]
    TrustAnchor {
        /// Offending file.
        path: PathBuf,
        /// Error reported by the TLS engine.
        #[source]
        source: rustls::Error,
    },
    /// A parameter key was not recognised.
    #[error("unknown secure-transport parameter '{key}'")]
    UnknownParameter {
        /// Offending key.
        key: String,
    },
    /// A parameter value could not be parsed.
    #[error("invalid value '{value}' for secure-transport parameter '{key}'")]
    InvalidValue {
        /// Parameter key.
        key: String,
        /// Rejected value.
        value: String,
    },
    /// The host name cannot be used for server name indication.
    #[error("'{host}' is not a valid TLS server name")]
    InvalidServerName {
        /// Rejected host.
        host: String,
    },
    /// The environment's role does not match the session direction.
    #[error("a {role} environment cannot {direction} connections")]
    RoleMismatch {
        /// Role of the environment.
        role: &'static str,
        /// Attempted direction.
        direction: &'static str,
    },
    /// Building the TLS context failed.
    #[error("failed to build TLS context: {0}")]
    Context(#[source] rustls::Error),
    /// Building the client certificate verifier failed.
    #[error("failed to build client verifier: {0}")]
    Verifier(#[source] rustls::server::VerifierBuilderError),
}
