//! Lifecycle hooks around the plan-act-observe loop.
//!
//! Hooks run in priority order (lower first) at named points. Each may let
//! the loop continue, veto the upcoming action, rewrite a tool call's
//! arguments, or ask for a message to be injected as the next user turn.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::llm::ToolCall;
use crate::tools::ToolExecutionResult;

const DEFAULT_HOOK_PRIORITY: u32 = 100;

/// Where in the loop a hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforePromptSubmit,
    BeforeToolExecute,
    AfterToolExecute,
    AfterAssistantResponse,
    IterationTick,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforePromptSubmit => "before_prompt_submit",
            Self::BeforeToolExecute => "before_tool_execute",
            Self::AfterToolExecute => "after_tool_execute",
            Self::AfterAssistantResponse => "after_assistant_response",
            Self::IterationTick => "iteration_tick",
        }
    }
}

/// Payload delivered to a hook.
#[derive(Debug, Clone)]
pub enum HookEvent {
    PromptSubmit { message_count: usize },
    ToolCall { call: ToolCall },
    ToolResult { call: ToolCall, result: ToolExecutionResult },
    AssistantResponse { content: String, tool_call_count: usize },
    IterationTick { iteration: u32 },
}

impl HookEvent {
    pub fn hook_point(&self) -> HookPoint {
        match self {
            Self::PromptSubmit { .. } => HookPoint::BeforePromptSubmit,
            Self::ToolCall { .. } => HookPoint::BeforeToolExecute,
            Self::ToolResult { .. } => HookPoint::AfterToolExecute,
            Self::AssistantResponse { .. } => HookPoint::AfterAssistantResponse,
            Self::IterationTick { .. } => HookPoint::IterationTick,
        }
    }
}

/// Which loop is firing the hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// `"main"` for the primary loop, the sub-agent id otherwise.
    pub agent_id: String,
    pub iteration: u32,
}

/// What a single hook wants the loop to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    Veto { reason: String },
    RewriteArguments { arguments: String },
    Inject { message: String },
}

impl HookOutcome {
    pub fn ok() -> Self {
        Self::Continue
    }

    pub fn veto(reason: impl Into<String>) -> Self {
        Self::Veto {
            reason: reason.into(),
        }
    }

    pub fn rewrite(arguments: impl Into<String>) -> Self {
        Self::RewriteArguments {
            arguments: arguments.into(),
        }
    }

    pub fn inject(message: impl Into<String>) -> Self {
        Self::Inject {
            message: message.into(),
        }
    }
}

/// Errors raised by a hook implementation.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// How a hook error is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookFailureMode {
    /// Log and continue.
    #[default]
    FailOpen,
    /// Treat the error as a veto.
    FailClosed,
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn hook_points(&self) -> &[HookPoint];

    fn failure_mode(&self) -> HookFailureMode {
        HookFailureMode::FailOpen
    }

    async fn execute(&self, event: &HookEvent, ctx: &HookContext)
    -> Result<HookOutcome, HookError>;
}

/// Combined result of running every hook registered for a point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookDecision {
    pub veto: Option<String>,
    /// Final arguments after all rewrites (tool events only).
    pub arguments: Option<String>,
    pub injections: Vec<String>,
}

impl HookDecision {
    pub fn is_vetoed(&self) -> bool {
        self.veto.is_some()
    }
}

struct RegisteredHook {
    priority: u32,
    hook: Arc<dyn Hook>,
}

/// Ordered set of hooks shared by the loop and every sub-agent.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<RegisteredHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, hook: Arc<dyn Hook>) {
        self.register_with_priority(hook, DEFAULT_HOOK_PRIORITY)
            .await;
    }

    pub async fn register_with_priority(&self, hook: Arc<dyn Hook>, priority: u32) {
        let mut hooks = self.hooks.write().await;
        tracing::debug!(hook = hook.name(), priority, "Registered hook");
        hooks.push(RegisteredHook { priority, hook });
        // Stable: equal priorities keep registration order.
        hooks.sort_by_key(|h| h.priority);
    }

    pub async fn len(&self) -> usize {
        self.hooks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hooks.read().await.is_empty()
    }

    /// Run every hook registered for the event's point.
    ///
    /// The first veto stops the chain. Argument rewrites apply in order, and
    /// later hooks see the rewritten call.
    pub async fn run(&self, event: HookEvent, ctx: &HookContext) -> HookDecision {
        let point = event.hook_point();
        let hooks: Vec<Arc<dyn Hook>> = self
            .hooks
            .read()
            .await
            .iter()
            .filter(|h| h.hook.hook_points().contains(&point))
            .map(|h| Arc::clone(&h.hook))
            .collect();

        let mut decision = HookDecision::default();
        let mut event = event;

        for hook in hooks {
            let outcome = match hook.execute(&event, ctx).await {
                Ok(outcome) => outcome,
                Err(e) => match hook.failure_mode() {
                    HookFailureMode::FailOpen => {
                        tracing::warn!(
                            hook = hook.name(),
                            point = point.as_str(),
                            error = %e,
                            "Hook failed, continuing"
                        );
                        HookOutcome::Continue
                    }
                    HookFailureMode::FailClosed => HookOutcome::veto(e.to_string()),
                },
            };

            match outcome {
                HookOutcome::Continue => {}
                HookOutcome::Veto { reason } => {
                    tracing::info!(
                        hook = hook.name(),
                        point = point.as_str(),
                        agent = %ctx.agent_id,
                        reason = %reason,
                        "Hook vetoed continuation"
                    );
                    decision.veto = Some(reason);
                    break;
                }
                HookOutcome::RewriteArguments { arguments } => {
                    match &mut event {
                        HookEvent::ToolCall { call } | HookEvent::ToolResult { call, .. } => {
                            call.arguments = arguments.clone();
                            decision.arguments = Some(arguments);
                        }
                        _ => {
                            tracing::warn!(
                                hook = hook.name(),
                                point = point.as_str(),
                                "Argument rewrite ignored outside tool hooks"
                            );
                        }
                    }
                }
                HookOutcome::Inject { message } => decision.injections.push(message),
            }
        }

        decision
    }
}
