//! OS command handler
//!
//! Runs a program from a fixed allow-list with caller-supplied arguments. The
//! program is started directly (no shell), so arguments are never interpreted.

use crate::command::envelope::CommandEnvelope;
use cmdbroker_shared::CommandResult;
use serde_json::Value;
use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum OsCommandError {
    #[error("Command '{0}' is not allowed")]
    NotAllowed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(&'static str),

    #[error("Command timed out")]
    TimedOut,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Handles `os` commands
#[derive(Debug, Clone)]
pub struct OsCommandHandler {
    allowed: Arc<BTreeSet<String>>,
    timeout: Duration,
}

impl OsCommandHandler {
    pub fn new<I, S>(allowed: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: Arc::new(
                allowed
                    .into_iter()
                    .map(|name| name.as_ref().to_lowercase())
                    .collect(),
            ),
            timeout,
        }
    }

    pub async fn process(&self, envelope: &CommandEnvelope) -> CommandResult {
        match self.run(envelope).await {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "OS command failed");
                CommandResult::error(e.to_string())
            }
        }
    }

    async fn run(&self, envelope: &CommandEnvelope) -> Result<CommandResult, OsCommandError> {
        let command_name = match envelope.get("command_name") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(name)) => name.to_lowercase(),
            Some(other) => other.to_string(),
        };
        if !self.allowed.contains(&command_name) {
            return Err(OsCommandError::NotAllowed(command_name));
        }

        let parameters = parameters(envelope.get("parameters"))?;

        let child = Command::new(&command_name)
            .args(&parameters)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(command = %command_name, timeout_ms = self.timeout.as_millis() as u64, "OS command timed out");
                return Err(OsCommandError::TimedOut);
            }
        };

        debug!(command = %command_name, status = %output.status, "OS command finished");

        Ok(CommandResult::success()
            .with_field("output", String::from_utf8_lossy(&output.stdout).into_owned())
            .with_field("error", String::from_utf8_lossy(&output.stderr).into_owned()))
    }
}

/// Missing parameters mean no arguments; anything but a list of strings is rejected
fn parameters(value: Option<&Value>) -> Result<Vec<String>, OsCommandError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(String::from)
                    .ok_or(OsCommandError::InvalidParameters("every parameter must be a string"))
            })
            .collect(),
        Some(_) => Err(OsCommandError::InvalidParameters("expected a list of strings")),
    }
}
