//! Connection handlers invoked by workers once a session is established.
//!
//! A handler receives the session by mutable reference and must not keep
//! it past its own return; the worker closes the session afterwards
//! whatever the outcome.

mod echo;
mod registry;

use quay_transport::{Session, TransportError};
use thiserror::Error;

pub use echo::EchoHandler;
pub use registry::{HandlerFactory, HandlerRegistry};

pub(crate) const HANDLER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handler");

/// Serves one connection.
pub trait ConnectionHandler: Send + Sync {
    /// Uses the session until the exchange is complete.
    fn handle(&self, session: &mut Session) -> Result<(), HandlerError>;
}

/// Errors raised by handler resolution and by handlers themselves.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler is registered under the configured name.
    #[error("unknown connection handler '{name}' (available: {available})")]
    Unknown {
        /// Name from the configuration.
        name: String,
        /// Comma-separated registered names.
        available: String,
    },
    /// The handler rejected its configuration.
    #[error("handler '{name}' rejected its configuration: {reason}")]
    Rejected {
        /// Handler name.
        name: String,
        /// Why the configuration was refused.
        reason: String,
    },
    /// Session I/O failed while serving the connection.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
