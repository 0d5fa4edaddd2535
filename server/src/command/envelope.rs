//! Decoded request payloads

use cmdbroker_shared::{errors, CommandResult};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Envelope-level failures, answered by the dispatcher without running a handler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Invalid JSON format: {0}")]
    InvalidJson(String),

    #[error("{}", errors::MISSING_COMMAND_TYPE)]
    MissingCommandType,

    #[error("Unknown command type: {0}")]
    UnknownCommandType(String),

    #[error("{}", errors::SERVER_BUSY)]
    ServerBusy,

    #[error("{}", errors::SHUTTING_DOWN)]
    ShuttingDown,
}

impl From<RequestError> for CommandResult {
    fn from(err: RequestError) -> Self {
        CommandResult::error(err.to_string())
    }
}

/// An immutable request mapping
///
/// Cloning is cheap; clones share the decoded fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    fields: Arc<Map<String, Value>>,
}

impl CommandEnvelope {
    /// Parse a raw payload. Anything but a JSON object is rejected.
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => Ok(Self {
                fields: Arc::new(fields),
            }),
            Ok(other) => Err(RequestError::InvalidJson(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
            Err(e) => Err(RequestError::InvalidJson(e.to_string())),
        }
    }

    /// The routing tag
    ///
    /// Absent, null, empty and other falsy values count as missing. A
    /// non-string value is reported verbatim as an unknown type.
    pub fn command_type(&self) -> Result<&str, RequestError> {
        match self.fields.get("command_type") {
            None => Err(RequestError::MissingCommandType),
            Some(value) if is_falsy(value) => Err(RequestError::MissingCommandType),
            Some(Value::String(command_type)) => Ok(command_type),
            Some(other) => Err(RequestError::UnknownCommandType(other.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object() {
        let envelope = CommandEnvelope::decode(br#"{"command_type":"compute","expression":"1"}"#).unwrap();
        assert_eq!(envelope.command_type(), Ok("compute"));
        assert_eq!(envelope.get("expression"), Some(&Value::from("1")));
        assert_eq!(envelope.get("missing"), None);
    }

    #[test]
    fn test_malformed_json() {
        let err = CommandEnvelope::decode(b"{\"command_type\": ").unwrap_err();
        assert!(matches!(err, RequestError::InvalidJson(_)));
        assert!(err.to_string().starts_with("Invalid JSON format: "));
    }

    #[test]
    fn test_non_utf8_is_invalid_json() {
        let err = CommandEnvelope::decode(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, RequestError::InvalidJson(_)));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = CommandEnvelope::decode(b"[1, 2]").unwrap_err();
        assert_eq!(
            err,
            RequestError::InvalidJson("expected a JSON object, found an array".into())
        );
    }

    #[test]
    fn test_missing_command_type() {
        for payload in [r#"{}"#, r#"{"command_type":null}"#, r#"{"command_type":""}"#, r#"{"command_type":false}"#] {
            let envelope = CommandEnvelope::decode(payload.as_bytes()).unwrap();
            assert_eq!(envelope.command_type(), Err(RequestError::MissingCommandType), "{}", payload);
        }
    }

    #[test]
    fn test_non_string_command_type_is_unknown() {
        let envelope = CommandEnvelope::decode(br#"{"command_type":5}"#).unwrap();
        assert_eq!(
            envelope.command_type(),
            Err(RequestError::UnknownCommandType("5".into()))
        );
    }

    #[test]
    fn test_request_error_into_result() {
        let result: CommandResult = RequestError::MissingCommandType.into();
        assert_eq!(result.error_message(), Some(errors::MISSING_COMMAND_TYPE));

        let result: CommandResult = RequestError::UnknownCommandType("shell".into()).into();
        assert_eq!(result.error_message(), Some("Unknown command type: shell"));
    }
}
