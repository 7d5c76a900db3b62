//! The `Tool` trait and its execution types.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub use crate::error::ToolError;

/// Default per-call execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// What a tool knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Task the decision loop is working on.
    pub task_id: Uuid,
    pub task_title: String,
}

impl ToolContext {
    pub fn new(task_id: Uuid, task_title: impl Into<String>) -> Self {
        Self {
            task_id,
            task_title: task_title.into(),
        }
    }
}

/// Output of a successful tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: Value::String(text.into()),
            duration,
        }
    }

    /// Text handed back to the model.
    pub fn to_observation(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A capability the decision loop can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    /// Upper bound on a single call. The gateway enforces it.
    fn execution_timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }
}

/// Fetch a required string parameter.
pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing required string '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_present_and_missing() {
        let params = json!({"query": "bob", "limit": 3});
        assert_eq!(require_str(&params, "query").unwrap(), "bob");
        assert!(matches!(
            require_str(&params, "limit"),
            Err(ToolError::InvalidParameters(_))
        ));
        assert!(require_str(&params, "nope").is_err());
    }

    #[test]
    fn observation_unwraps_strings() {
        let d = Duration::from_millis(1);
        assert_eq!(ToolOutput::text("plain", d).to_observation(), "plain");
        assert_eq!(
            ToolOutput::success(json!({"n": 1}), d).to_observation(),
            r#"{"n":1}"#
        );
    }
}
