//! Instrumented handler for dispatcher tests
//!
//! Echoes the request's `tag` field after sleeping `delay_ms`, and panics when
//! `panic` is true.

use crate::command::envelope::CommandEnvelope;
use cmdbroker_shared::CommandResult;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ProbeHandler;

impl ProbeHandler {
    pub async fn process(&self, envelope: &CommandEnvelope) -> CommandResult {
        let delay = envelope.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if envelope.get("panic").and_then(Value::as_bool) == Some(true) {
            panic!("probe asked to panic");
        }
        CommandResult::success().with_field("tag", envelope.get("tag").cloned().unwrap_or(Value::Null))
    }
}
