//! Delegation tools: let the model spawn and talk to sub-agents.
//!
//! Registered as built-ins when a loop is given a [`SubAgentManager`], so
//! they go through the same dispatch, retry and advisory path as any tool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::tools::{Tool, ToolError, ToolOutput, ToolRegistry, require_str};
use crate::worker::SubAgentManager;

/// Register every delegation tool on `registry`.
pub async fn register_delegation_tools(registry: &ToolRegistry, manager: Arc<SubAgentManager>) {
    registry
        .register_builtin(Arc::new(SpawnAgentTool::new(Arc::clone(&manager))))
        .await;
    registry
        .register_builtin(Arc::new(MessageAgentTool::new(Arc::clone(&manager))))
        .await;
    registry
        .register_builtin(Arc::new(WaitAgentTool::new(Arc::clone(&manager))))
        .await;
    registry
        .register_builtin(Arc::new(AgentStatusTool::new(manager)))
        .await;
}

fn parse_id(tool: &str, raw: &str) -> Result<Uuid, ToolError> {
    Uuid::parse_str(raw).map_err(|e| ToolError::InvalidParameters {
        name: tool.to_string(),
        reason: format!("invalid agent_id '{raw}': {e}"),
    })
}

fn failed(tool: &str, reason: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        name: tool.to_string(),
        reason: reason.to_string(),
    }
}

// ── SpawnAgentTool ──────────────────────────────────────────────────

pub struct SpawnAgentTool {
    manager: Arc<SubAgentManager>,
}

impl SpawnAgentTool {
    pub fn new(manager: Arc<SubAgentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Start a sub-agent on a self-contained task. It runs in the background with \
         its own conversation; use wait_agent to collect its result."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Instructions for the sub-agent"
                },
                "system_prompt": {
                    "type": "string",
                    "description": "Optional system prompt for the sub-agent"
                },
                "max_iterations": {
                    "type": "integer",
                    "description": "Iteration cap (optional, defaults to the configured value)"
                },
                "wait": {
                    "type": "boolean",
                    "description": "Block until the sub-agent finishes and return its result"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let task = require_str(self.name(), &params, "task")?;

        let mut config = self.manager.config_for(task);
        if let Some(prompt) = params.get("system_prompt").and_then(|v| v.as_str()) {
            config = config.with_system_prompt(prompt);
        }
        if let Some(max) = params.get("max_iterations").and_then(|v| v.as_u64()) {
            config = config.with_max_iterations(max.min(u32::MAX as u64) as u32);
        }

        let id = self
            .manager
            .spawn(config)
            .await
            .map_err(|e| failed(self.name(), e))?;

        if params.get("wait").and_then(|v| v.as_bool()).unwrap_or(false) {
            let result = self
                .manager
                .wait(id)
                .await
                .map_err(|e| failed(self.name(), e))?;
            let value = serde_json::to_value(result.as_ref()).map_err(|e| failed(self.name(), e))?;
            return Ok(ToolOutput::json(&value, start.elapsed()));
        }

        Ok(ToolOutput::json(
            &serde_json::json!({ "agent_id": id, "status": "queued" }),
            start.elapsed(),
        ))
    }
}

// ── MessageAgentTool ────────────────────────────────────────────────

pub struct MessageAgentTool {
    manager: Arc<SubAgentManager>,
}

impl MessageAgentTool {
    pub fn new(manager: Arc<SubAgentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for MessageAgentTool {
    fn name(&self) -> &str {
        "message_agent"
    }

    fn description(&self) -> &str {
        "Send a message to a running sub-agent. With wait=true, block until it answers \
         or the timeout expires."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string" },
                "message": { "type": "string" },
                "wait": {
                    "type": "boolean",
                    "description": "Wait for the sub-agent's next answer"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "How long to wait for an answer (optional)"
                }
            },
            "required": ["agent_id", "message"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let id = parse_id(self.name(), require_str(self.name(), &params, "agent_id")?)?;
        let message = require_str(self.name(), &params, "message")?;

        if !params.get("wait").and_then(|v| v.as_bool()).unwrap_or(false) {
            self.manager
                .send_user_message(id, message)
                .await
                .map_err(|e| failed(self.name(), e))?;
            return Ok(ToolOutput::text("Message delivered.", start.elapsed()));
        }

        let timeout = params
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);
        let answer = self
            .manager
            .send_user_message_and_wait(id, message, timeout)
            .await
            .map_err(|e| failed(self.name(), e))?;
        Ok(ToolOutput::text(answer, start.elapsed()))
    }
}

// ── WaitAgentTool ───────────────────────────────────────────────────

pub struct WaitAgentTool {
    manager: Arc<SubAgentManager>,
}

impl WaitAgentTool {
    pub fn new(manager: Arc<SubAgentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for WaitAgentTool {
    fn name(&self) -> &str {
        "wait_agent"
    }

    fn description(&self) -> &str {
        "Wait for one or more sub-agents to finish and return their results."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent_ids": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["agent_ids"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let raw = params
            .get("agent_ids")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "missing required array parameter 'agent_ids'".to_string(),
            })?;

        let ids = raw
            .iter()
            .map(|v| parse_id(self.name(), v.as_str().unwrap_or_default()))
            .collect::<Result<Vec<_>, _>>()?;

        let results = self
            .manager
            .wait_all(&ids)
            .await
            .map_err(|e| failed(self.name(), e))?;

        let ordered: Vec<serde_json::Value> = ids
            .iter()
            .filter_map(|id| results.get(id))
            .filter_map(|r| serde_json::to_value(r.as_ref()).ok())
            .collect();
        Ok(ToolOutput::json(
            &serde_json::Value::Array(ordered),
            start.elapsed(),
        ))
    }
}

// ── AgentStatusTool ─────────────────────────────────────────────────

pub struct AgentStatusTool {
    manager: Arc<SubAgentManager>,
}

impl AgentStatusTool {
    pub fn new(manager: Arc<SubAgentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for AgentStatusTool {
    fn name(&self) -> &str {
        "agent_status"
    }

    fn description(&self) -> &str {
        "Report scheduler occupancy and the progress of running sub-agents."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent_id": {
                    "type": "string",
                    "description": "Limit the report to one sub-agent (optional)"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();

        if let Some(raw) = params.get("agent_id").and_then(|v| v.as_str()) {
            let id = parse_id(self.name(), raw)?;
            let value = if let Some(progress) = self.manager.progress(id).await {
                serde_json::to_value(progress).map_err(|e| failed(self.name(), e))?
            } else if let Some(result) = self.manager.result(id).await {
                serde_json::to_value(result.as_ref()).map_err(|e| failed(self.name(), e))?
            } else {
                return Err(failed(self.name(), format!("unknown agent_id {id}")));
            };
            return Ok(ToolOutput::json(&value, start.elapsed()));
        }

        let queue = self
            .manager
            .queue_status()
            .await
            .map_err(|e| failed(self.name(), e))?;
        let mut agents = Vec::new();
        for id in self.manager.active_ids().await {
            if let Some(progress) = self.manager.progress(id).await {
                agents.push(progress);
            }
        }

        Ok(ToolOutput::json(
            &serde_json::json!({ "queue": queue, "agents": agents }),
            start.elapsed(),
        ))
    }
}
