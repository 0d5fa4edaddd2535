//! Handler registry: maps `command_type` tags to handlers

use super::envelope::{CommandEnvelope, RequestError};
use super::handlers::{Handler, MathCommandHandler, OsCommandHandler};
use crate::config::ServerConfig;
use cmdbroker_shared::{COMPUTE_COMMAND, OS_COMMAND};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fixed mapping from command type to handler, built once at startup
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `os` and `compute` handlers
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new()
            .with_handler(
                OS_COMMAND,
                Handler::Os(OsCommandHandler::new(&config.allowed_commands, config.command_timeout)),
            )
            .with_handler(COMPUTE_COMMAND, Handler::Compute(MathCommandHandler))
    }

    /// Register `handler` under `command_type`, replacing any previous entry
    pub fn with_handler(mut self, command_type: impl Into<String>, handler: Handler) -> Self {
        self.handlers.insert(command_type.into(), Arc::new(handler));
        self
    }

    /// Look up the handler for a command type
    pub fn resolve(&self, command_type: &str) -> Result<Arc<Handler>, RequestError> {
        self.handlers
            .get(command_type)
            .cloned()
            .ok_or_else(|| RequestError::UnknownCommandType(command_type.to_string()))
    }

    /// Decode a payload and find the handler its `command_type` names
    pub fn route(&self, payload: &[u8]) -> Result<(Arc<Handler>, CommandEnvelope), RequestError> {
        let envelope = CommandEnvelope::decode(payload)?;
        let handler = self.resolve(envelope.command_type()?)?;
        Ok((handler, envelope))
    }

    pub fn command_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
