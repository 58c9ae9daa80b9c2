//! Scripted model and tool doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LlmError, ToolError};
use crate::llm::{DeltaStream, FinishReason, LlmProvider, StreamDelta, ToolCall, TurnRequest};
use crate::tools::{Tool, ToolOutput};

pub fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

/// Replays one delta script per turn and records every request.
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<StreamDelta>>>,
    requests: Mutex<Vec<TurnRequest>>,
    delay: Duration,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Vec<StreamDelta>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Sleep before answering each turn.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn text(content: &str) -> Vec<StreamDelta> {
        vec![
            StreamDelta::Content(content.to_string()),
            StreamDelta::Finish(FinishReason::Stop),
        ]
    }

    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Vec<StreamDelta> {
        vec![
            StreamDelta::ToolCallStart {
                index: 0,
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamDelta::ToolCallArguments {
                index: 0,
                fragment: arguments.to_string(),
            },
            StreamDelta::Finish(FinishReason::ToolUse),
        ]
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_turn(&self, request: TurnRequest) -> Result<DeltaStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "script exhausted".into(),
            })?;
        Ok(Box::pin(futures::stream::iter(script.into_iter().map(Ok))))
    }
}

/// Succeeds with a fixed output and logs each invocation.
pub struct MockTool {
    name: String,
    output: String,
    log: Arc<Mutex<Vec<String>>>,
    args: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            output: format!("{name} ok"),
            log: Arc::new(Mutex::new(Vec::new())),
            args: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    /// Share an invocation log with other tools.
    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = log;
        self
    }

    pub fn shared_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    pub fn shared_args(&self) -> Arc<Mutex<Vec<serde_json::Value>>> {
        Arc::clone(&self.args)
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "mock tool"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        self.log.lock().unwrap().push(self.name.clone());
        self.args.lock().unwrap().push(params);
        Ok(ToolOutput::text(self.output.clone(), Duration::ZERO))
    }
}

/// Always fails with the given reason.
pub struct FailingTool {
    name: String,
    reason: String,
}

impl FailingTool {
    pub fn new(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::ExecutionFailed {
            name: self.name.clone(),
            reason: self.reason.clone(),
        })
    }
}

/// Fails `failures` times, then succeeds.
pub struct FlakyTool {
    name: String,
    failures: u32,
    error: String,
    attempts: Arc<AtomicU32>,
}

impl FlakyTool {
    pub fn new(name: &str, failures: u32, error: &str) -> Self {
        Self {
            name: name.to_string(),
            failures,
            error: error.to_string(),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn attempts(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "fails a fixed number of times"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ToolError::ExecutionFailed {
                name: self.name.clone(),
                reason: self.error.clone(),
            });
        }
        Ok(ToolOutput::text("recovered", Duration::ZERO))
    }
}

pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "panics"
    }

    fn description(&self) -> &str {
        "panics when executed"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        panic!("tool exploded");
    }
}
