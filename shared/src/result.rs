//! Command results as they travel back to the caller

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome tag carried in every response's `status` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::Error => write!(f, "error"),
        }
    }
}

/// Structured response for a single command
///
/// Serializes as a flat JSON object whose `status` field is always present:
/// `{"status":"success", ...handler fields}` or `{"status":"error","error":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CommandResult {
    /// Handler-specific success fields
    Success(Map<String, Value>),
    /// Human-readable failure description
    Error { error: String },
}

impl CommandResult {
    /// Empty success result, extended with [`CommandResult::with_field`]
    pub fn success() -> Self {
        CommandResult::Success(Map::new())
    }

    /// Error result carrying `message`
    pub fn error(message: impl Into<String>) -> Self {
        CommandResult::Error {
            error: message.into(),
        }
    }

    /// Add a field to a success result. Error results are returned unchanged.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let CommandResult::Success(fields) = &mut self {
            fields.insert(key.into(), value.into());
        }
        self
    }

    pub fn status(&self) -> ResultStatus {
        match self {
            CommandResult::Success(_) => ResultStatus::Success,
            CommandResult::Error { .. } => ResultStatus::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Success(_))
    }

    /// The error message, if this is an error result
    pub fn error_message(&self) -> Option<&str> {
        match self {
            CommandResult::Error { error } => Some(error),
            CommandResult::Success(_) => None,
        }
    }

    /// Look up a success field
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            CommandResult::Success(fields) => fields.get(key),
            CommandResult::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_serializes_flat() {
        let result = CommandResult::success().with_field("result", 40);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"status": "success", "result": 40}));
    }

    #[test]
    fn test_error_serializes_with_message() {
        let result = CommandResult::error("Missing command_type");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"status": "error", "error": "Missing command_type"}));
    }

    #[test]
    fn test_parse_os_success() {
        let result: CommandResult =
            serde_json::from_str(r#"{"status":"success","output":"hi\n","error":""}"#).unwrap();
        assert_eq!(result.status(), ResultStatus::Success);
        assert_eq!(result.field("output"), Some(&json!("hi\n")));
        // A success field named "error" is not an error message
        assert_eq!(result.error_message(), None);
    }

    #[test]
    fn test_parse_rejects_unknown_status() {
        let parsed = serde_json::from_str::<CommandResult>(r#"{"status":"pending"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_with_field_ignored_on_error() {
        let result = CommandResult::error("boom").with_field("result", 1);
        assert_eq!(result, CommandResult::error("boom"));
    }
}
