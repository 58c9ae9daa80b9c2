//! Tool contract and execution results.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::error::ToolError;

/// Output of a successful tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            duration,
        }
    }

    /// Pretty-printed JSON output.
    pub fn json(value: &serde_json::Value, duration: Duration) -> Self {
        let content = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self { content, duration }
    }
}

/// Outcome of dispatching one tool call. Dispatch never fails past this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Text fed back to the model as the tool-result message.
    pub fn to_model_text(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("tool failed without a message")
            )
        }
    }
}

/// A capability the model can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required string parameter '{key}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_text_for_failure_is_prefixed() {
        let result = ToolExecutionResult::failed("no such file");
        assert_eq!(result.to_model_text(), "Error: no such file");
        assert!(!result.success);
    }

    #[test]
    fn require_str_reports_missing_key() {
        let params = serde_json::json!({"path": 3});
        let err = require_str("read_file", &params, "path").unwrap_err();
        assert!(err.to_string().contains("'path'"));

        let params = serde_json::json!({"path": "a.rs"});
        assert_eq!(require_str("read_file", &params, "path").unwrap(), "a.rs");
    }

    #[test]
    fn execution_result_serde_skips_empty_fields() {
        let json = serde_json::to_string(&ToolExecutionResult::ok("done")).unwrap();
        assert_eq!(json, r#"{"success":true,"output":"done"}"#);
    }
}
