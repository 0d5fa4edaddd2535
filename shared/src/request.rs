//! Request builders for the built-in command types

use serde::Serialize;
use serde_json::{json, Value};

/// `command_type` tag for OS commands
pub const OS_COMMAND: &str = "os";

/// `command_type` tag for arithmetic expressions
pub const COMPUTE_COMMAND: &str = "compute";

/// A request mapping ready to be framed and sent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CommandRequest(Value);

impl CommandRequest {
    /// Run an allow-listed OS program with the given arguments
    pub fn os<I, S>(command_name: impl Into<String>, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parameters: Vec<String> = parameters.into_iter().map(Into::into).collect();
        Self(json!({
            "command_type": OS_COMMAND,
            "command_name": command_name.into(),
            "parameters": parameters,
        }))
    }

    /// Evaluate an arithmetic expression
    pub fn compute(expression: impl Into<String>) -> Self {
        Self(json!({
            "command_type": COMPUTE_COMMAND,
            "expression": expression.into(),
        }))
    }

    /// Send an arbitrary JSON value as-is
    pub fn raw(value: Value) -> Self {
        Self(value)
    }

    /// The `command_type` tag, if the request carries one
    pub fn command_type(&self) -> Option<&str> {
        self.0.get("command_type").and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}
