//! Tool registry and dispatch boundary.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::RwLock;

use crate::llm::ToolDefinition;
use crate::tools::tool::{Tool, ToolExecutionResult};

/// Names reserved for the delegation tools; dynamic registrations cannot
/// shadow them.
const PROTECTED_TOOL_NAMES: &[&str] = &["spawn_agent", "message_agent", "wait_agent", "agent_status"];

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Tracks which names were registered as built-in (protected from shadowing).
    builtin_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Copy every tool of `base` into a new registry. Later registrations on
    /// either registry are not shared.
    pub async fn overlay(base: &ToolRegistry) -> Self {
        let tools = base.tools.read().await.clone();
        let builtins = base.builtin_names.read().await.clone();
        Self {
            tools: RwLock::new(tools),
            builtin_names: RwLock::new(builtins),
        }
    }

    /// Register a tool. Rejects dynamic tools that try to shadow a built-in name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.builtin_names.read().await.contains(&name) {
            tracing::warn!(
                tool = %name,
                "Rejected tool registration: would shadow a built-in tool"
            );
            return;
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!("Registered tool: {}", name);
    }

    /// Register a built-in tool (marks protected names).
    pub async fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if PROTECTED_TOOL_NAMES.contains(&name.as_str()) {
            self.builtin_names.write().await.insert(name.clone());
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!("Registered built-in tool: {}", name);
    }

    /// Unregister a tool.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().await.remove(name)
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Check if a tool exists.
    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// List all tool names.
    pub async fn list(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Get the number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Get tool definitions for LLM function calling, sorted by name so the
    /// schema list is stable across turns.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Dispatch a call by name with serialized JSON arguments.
    ///
    /// Unknown tools, malformed arguments, tool errors and tool panics all
    /// come back as a failed [`ToolExecutionResult`].
    pub async fn execute(&self, name: &str, arguments: &str) -> ToolExecutionResult {
        let Some(tool) = self.get(name).await else {
            return ToolExecutionResult::failed(format!("Tool {name} not found"));
        };

        let params: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => {
                return ToolExecutionResult::failed(format!(
                    "Failed to parse arguments for {name}: {e}"
                ));
            }
        };

        tracing::debug!(tool = %name, params = %params, "Tool call started");
        let start = std::time::Instant::now();

        let result = AssertUnwindSafe(tool.execute(params)).catch_unwind().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                tracing::debug!(tool = %name, elapsed_ms, "Tool call succeeded");
                ToolExecutionResult::ok(output.content)
            }
            Ok(Err(e)) => {
                tracing::debug!(tool = %name, elapsed_ms, error = %e, "Tool call failed");
                ToolExecutionResult::failed(e.to_string())
            }
            Err(_) => {
                tracing::error!(tool = %name, elapsed_ms, "Tool panicked");
                ToolExecutionResult::failed(format!("Tool {name} panicked during execution"))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
