//! Name-to-handler resolution performed once at start-up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use tracing::info;

use super::echo::EchoHandler;
use super::{ConnectionHandler, HANDLER_TARGET, HandlerError};

/// Builds a handler from its optional configuration file.
pub type HandlerFactory =
    fn(Option<&Utf8Path>) -> Result<Arc<dyn ConnectionHandler>, HandlerError>;

/// Registered connection handlers keyed by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in handlers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", EchoHandler::build);
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: HandlerFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Resolves and builds the handler registered as `name`.
    pub fn resolve(
        &self,
        name: &str,
        config: Option<&Utf8Path>,
    ) -> Result<Arc<dyn ConnectionHandler>, HandlerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| HandlerError::Unknown {
                name: name.to_owned(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })?;
        let handler = factory(config)?;
        info!(
            target: HANDLER_TARGET,
            handler = name,
            config = ?config,
            "connection handler resolved"
        );
        Ok(handler)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
