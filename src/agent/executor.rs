//! Turn protocol shared by the primary loop and every sub-agent.
//!
//! One turn: request a streamed model response (with the current failure
//! advisory appended), then dispatch the requested tool calls strictly in
//! order, running hooks around each call and retrying only what the recovery
//! policy allows.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::LlmError;
use crate::hooks::{HookContext, HookEvent, HookRegistry};
use crate::llm::{ChatMessage, LlmProvider, ToolCall, Turn, TurnRequest, request_turn};
use crate::tools::{ToolErrorRecovery, ToolExecutionResult, ToolRegistry};

/// Shared dependencies for loop and sub-agent execution.
#[derive(Clone)]
pub struct AgentDeps {
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
    pub recovery: Arc<ToolErrorRecovery>,
    pub hooks: Arc<HookRegistry>,
}

impl AgentDeps {
    pub fn new(llm: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            tools,
            recovery: Arc::new(ToolErrorRecovery::default()),
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<ToolErrorRecovery>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Outcome of dispatching every call of one turn.
#[derive(Debug, Default)]
pub struct ToolPhase {
    /// One tool-result message per requested call, in request order.
    pub results: Vec<ChatMessage>,
    /// Set when a hook vetoed; remaining calls were not executed.
    pub halted: Option<String>,
    /// Messages hooks asked to inject as the next user turn.
    pub injections: Vec<String>,
}

fn not_executed(call: &ToolCall, reason: &str) -> ChatMessage {
    ChatMessage::tool_result(
        &call.id,
        &call.name,
        format!("Error: not executed, loop halted: {reason}"),
    )
}

/// Tool results answering every call of a turn that was halted before any
/// of them ran, so the history stays valid for the next request.
pub fn unexecuted_results(calls: &[ToolCall], reason: &str) -> Vec<ChatMessage> {
    calls.iter().map(|call| not_executed(call, reason)).collect()
}

/// Runs turns against a set of [`AgentDeps`].
pub struct TurnExecutor {
    deps: AgentDeps,
}

impl TurnExecutor {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &AgentDeps {
        &self.deps
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.deps.hooks
    }

    /// Request one model turn over `messages`. The advisory is attached to
    /// the request only, never to the caller's history.
    pub async fn model_turn(&self, messages: &[ChatMessage]) -> Result<Turn, LlmError> {
        let mut request_messages = messages.to_vec();
        if let Some(advisory) = self.deps.recovery.build_advisory() {
            tracing::debug!("Attaching tool failure advisory to prompt");
            request_messages.push(ChatMessage::system(advisory));
        }
        let tools = self.deps.tools.tool_definitions().await;
        request_turn(
            self.deps.llm.as_ref(),
            TurnRequest::new(request_messages, tools),
        )
        .await
    }

    /// Execute `calls` sequentially, in the order the model requested them.
    pub async fn run_tool_calls(
        &self,
        ctx: &HookContext,
        calls: &[ToolCall],
        tools_used: &mut BTreeSet<String>,
    ) -> ToolPhase {
        let mut phase = ToolPhase::default();

        for call in calls {
            if let Some(reason) = &phase.halted {
                phase.results.push(not_executed(call, reason));
                continue;
            }

            let before = self
                .deps
                .hooks
                .run(HookEvent::ToolCall { call: call.clone() }, ctx)
                .await;
            phase.injections.extend(before.injections);

            if let Some(reason) = before.veto {
                let text = format!("Tool {} blocked: {reason}", call.name);
                self.deps.recovery.record_error(&call.name, &text);
                phase.results.push(ChatMessage::tool_result(
                    &call.id,
                    &call.name,
                    format!("Error: {text}"),
                ));
                phase.halted = Some(reason);
                continue;
            }

            let mut call = call.clone();
            if let Some(arguments) = before.arguments {
                call.arguments = arguments;
            }

            tools_used.insert(call.name.clone());
            let result = self.dispatch(&call).await;

            let after = self
                .deps
                .hooks
                .run(
                    HookEvent::ToolResult {
                        call: call.clone(),
                        result: result.clone(),
                    },
                    ctx,
                )
                .await;
            phase.injections.extend(after.injections);

            phase.results.push(ChatMessage::tool_result(
                &call.id,
                &call.name,
                result.to_model_text(),
            ));

            if let Some(reason) = after.veto {
                phase.halted = Some(reason);
            }
        }

        phase
    }

    /// Dispatch one call, recording failures and retrying transient ones for
    /// allow-listed tools.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolExecutionResult {
        let recovery = &self.deps.recovery;
        let max_retries = recovery.max_retries();
        let mut attempt = 0;

        loop {
            let result = self.deps.tools.execute(&call.name, &call.arguments).await;
            if result.success {
                return result;
            }

            let error = result.error.clone().unwrap_or_default();
            let category = recovery.record_error(&call.name, &error);

            if !recovery.should_retry(&call.name, &error, attempt, max_retries) {
                tracing::warn!(
                    tool = %call.name,
                    category = %category,
                    attempt,
                    error = %error,
                    "Tool call failed"
                );
                return result;
            }

            let delay = recovery.retry_delay(attempt);
            tracing::info!(
                tool = %call.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying transient tool failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
