//! Primary-session agentic loop.
//!
//! One call to [`AgenticLoop::process_user_message`] drives the model until
//! it produces a turn with no tool calls, a hook halts it, the iteration
//! budget runs out, or the model backend fails.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::conversation::{Conversation, InMemoryConversation};
use crate::agent::delegation::register_delegation_tools;
use crate::agent::executor::{AgentDeps, TurnExecutor, unexecuted_results};
use crate::config::AgentConfig;
use crate::hooks::{HookContext, HookEvent};
use crate::llm::{ChatMessage, Role};
use crate::tools::ToolRegistry;
use crate::worker::SubAgentManager;

const MAIN_AGENT_ID: &str = "main";

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Thinking,
    ToolExecuting,
    MaxIterationsReached,
    Halted,
    Errored,
}

/// How a user message was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The model answered without requesting tools.
    Completed { response: String, iterations: u32 },
    /// The iteration budget ran out; committed turns are kept.
    MaxIterationsReached { iterations: u32 },
    /// A hook vetoed continuation.
    Halted { reason: String, iterations: u32 },
    /// The model backend failed. The error is also the last assistant message.
    Errored { error: String, iterations: u32 },
}

impl LoopOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            Self::Completed { iterations, .. }
            | Self::MaxIterationsReached { iterations }
            | Self::Halted { iterations, .. }
            | Self::Errored { iterations, .. } => *iterations,
        }
    }
}

/// Post-run audit collaborator, invoked once per natural termination.
#[async_trait]
pub trait LoopAuditor: Send + Sync {
    async fn audit(&self, messages: &[ChatMessage], outcome: &LoopOutcome);
}

/// Auditor that does nothing.
pub struct NoopAuditor;

#[async_trait]
impl LoopAuditor for NoopAuditor {
    async fn audit(&self, _messages: &[ChatMessage], _outcome: &LoopOutcome) {}
}

pub struct AgenticLoop {
    config: AgentConfig,
    executor: TurnExecutor,
    conversation: Arc<dyn Conversation>,
    auditor: Arc<dyn LoopAuditor>,
    manager: Option<Arc<SubAgentManager>>,
    state: LoopState,
}

impl AgenticLoop {
    pub fn new(config: AgentConfig, deps: AgentDeps, conversation: Arc<dyn Conversation>) -> Self {
        Self {
            config,
            executor: TurnExecutor::new(deps),
            conversation,
            auditor: Arc::new(NoopAuditor),
            manager: None,
            state: LoopState::Idle,
        }
    }

    /// Loop over an in-memory history capped at
    /// `config.max_history_messages`.
    pub fn from_config(config: AgentConfig, deps: AgentDeps) -> Self {
        let conversation = Arc::new(InMemoryConversation::from_config(&config));
        Self::new(config, deps, conversation)
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn LoopAuditor>) -> Self {
        self.auditor = auditor;
        self
    }

    /// Expose delegation tools backed by `manager`. The loop's registry is
    /// overlaid, so the shared base registry used by sub-agents is untouched.
    pub async fn with_manager(mut self, manager: Arc<SubAgentManager>) -> Self {
        let mut deps = self.executor.deps().clone();
        let tools = ToolRegistry::overlay(&deps.tools).await;
        register_delegation_tools(&tools, Arc::clone(&manager)).await;
        deps.tools = Arc::new(tools);

        self.executor = TurnExecutor::new(deps);
        self.manager = Some(manager);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn manager(&self) -> Option<&Arc<SubAgentManager>> {
        self.manager.as_ref()
    }

    pub fn conversation(&self) -> &Arc<dyn Conversation> {
        &self.conversation
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.executor.deps().tools
    }

    /// Process one user message to completion.
    pub async fn process_user_message(&mut self, text: impl Into<String>) -> LoopOutcome {
        self.ensure_system_prompt().await;
        self.conversation.append(ChatMessage::user(text)).await;

        let hooks = Arc::clone(self.executor.hooks());
        let mut tools_used = BTreeSet::new();
        let mut iteration: u32 = 0;

        loop {
            let ctx = HookContext {
                agent_id: MAIN_AGENT_ID.to_string(),
                iteration: iteration + 1,
            };

            if let Some(max) = self.config.max_iterations.filter(|max| iteration >= *max) {
                tracing::warn!(
                    agent = %self.config.name,
                    max_iterations = max,
                    "iteration budget exhausted"
                );
                self.state = LoopState::MaxIterationsReached;
                return LoopOutcome::MaxIterationsReached { iterations: iteration };
            }

            let tick = hooks
                .run(HookEvent::IterationTick { iteration: ctx.iteration }, &ctx)
                .await;
            if let Some(reason) = tick.veto {
                return self.halt(reason, iteration);
            }
            self.inject(tick.injections).await;
            iteration += 1;
            self.state = LoopState::Thinking;

            let messages = self.conversation.messages().await;
            let submit = hooks
                .run(
                    HookEvent::PromptSubmit {
                        message_count: messages.len(),
                    },
                    &ctx,
                )
                .await;
            if let Some(reason) = submit.veto {
                return self.halt(reason, iteration);
            }
            let mut injections = submit.injections;

            let turn = match self.executor.model_turn(&messages).await {
                Ok(turn) => turn,
                Err(e) => {
                    let error = e.to_string();
                    tracing::error!(agent = %self.config.name, iteration, error = %error, "Model turn failed");
                    self.conversation
                        .append(ChatMessage::assistant(format!("Error: {error}")))
                        .await;
                    self.state = LoopState::Errored;
                    return LoopOutcome::Errored {
                        error,
                        iterations: iteration,
                    };
                }
            };

            tracing::debug!(
                iteration,
                tool_calls = turn.tool_calls.len(),
                finish_reason = ?turn.finish_reason,
                "Model turn complete"
            );

            let assistant = if turn.has_tool_calls() {
                ChatMessage::assistant_with_tool_calls(turn.content.clone(), turn.tool_calls.clone())
            } else {
                ChatMessage::assistant(turn.content.clone())
            };
            self.conversation.append(assistant).await;

            let response = hooks
                .run(
                    HookEvent::AssistantResponse {
                        content: turn.content.clone(),
                        tool_call_count: turn.tool_calls.len(),
                    },
                    &ctx,
                )
                .await;
            if let Some(reason) = response.veto {
                for result in unexecuted_results(&turn.tool_calls, &reason) {
                    self.conversation.append(result).await;
                }
                return self.halt(reason, iteration);
            }
            injections.extend(response.injections);

            if turn.has_tool_calls() {
                self.state = LoopState::ToolExecuting;
                let phase = self
                    .executor
                    .run_tool_calls(&ctx, &turn.tool_calls, &mut tools_used)
                    .await;
                for result in phase.results {
                    self.conversation.append(result).await;
                }
                injections.extend(phase.injections);
                self.inject(injections).await;

                if let Some(reason) = phase.halted {
                    return self.halt(reason, iteration);
                }
                continue;
            }

            if !injections.is_empty() {
                self.inject(injections).await;
                continue;
            }

            self.state = LoopState::Idle;
            let outcome = LoopOutcome::Completed {
                response: turn.content,
                iterations: iteration,
            };
            tracing::info!(
                agent = %self.config.name,
                iterations = iteration,
                tools = tools_used.len(),
                "Loop completed"
            );

            let messages = self.conversation.messages().await;
            self.auditor.audit(&messages, &outcome).await;
            self.conversation.compress().await;
            return outcome;
        }
    }

    async fn ensure_system_prompt(&self) {
        let Some(prompt) = &self.config.system_prompt else {
            return;
        };
        let messages = self.conversation.messages().await;
        if !messages.iter().any(|m| m.role == Role::System) {
            self.conversation
                .append(ChatMessage::system(prompt.clone()))
                .await;
        }
    }

    async fn inject(&self, injections: Vec<String>) {
        for message in injections {
            tracing::debug!("Injecting hook message as user turn");
            self.conversation.append(ChatMessage::user(message)).await;
        }
    }

    fn halt(&mut self, reason: String, iterations: u32) -> LoopOutcome {
        tracing::info!(agent = %self.config.name, reason = %reason, "Loop halted by hook");
        self.state = LoopState::Halted;
        LoopOutcome::Halted { reason, iterations }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::agent::conversation::InMemoryConversation;
    use crate::hooks::{Hook, HookError, HookOutcome, HookPoint};
    use crate::test_support::{MockTool, ScriptedLlm};

    #[derive(Default)]
    struct CountingAuditor(AtomicUsize);

    #[async_trait]
    impl LoopAuditor for CountingAuditor {
        async fn audit(&self, _messages: &[ChatMessage], _outcome: &LoopOutcome) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NudgeOnce(AtomicBool);

    #[async_trait]
    impl Hook for NudgeOnce {
        fn name(&self) -> &str {
            "nudge-once"
        }
        fn hook_points(&self) -> &[HookPoint] {
            &[HookPoint::AfterAssistantResponse]
        }
        async fn execute(
            &self,
            _event: &HookEvent,
            _ctx: &HookContext,
        ) -> Result<HookOutcome, HookError> {
            if self.0.swap(true, Ordering::SeqCst) {
                Ok(HookOutcome::ok())
            } else {
                Ok(HookOutcome::inject("double-check your answer"))
            }
        }
    }

    struct BlockAll;

    #[async_trait]
    impl Hook for BlockAll {
        fn name(&self) -> &str {
            "block-all"
        }
        fn hook_points(&self) -> &[HookPoint] {
            &[HookPoint::BeforeToolExecute]
        }
        async fn execute(
            &self,
            _event: &HookEvent,
            _ctx: &HookContext,
        ) -> Result<HookOutcome, HookError> {
            Ok(HookOutcome::veto("tools disabled"))
        }
    }

    /// Returns the same outcome at a single hook point.
    struct FixedHook {
        point: HookPoint,
        outcome: HookOutcome,
    }

    #[async_trait]
    impl Hook for FixedHook {
        fn name(&self) -> &str {
            "fixed"
        }
        fn hook_points(&self) -> &[HookPoint] {
            std::slice::from_ref(&self.point)
        }
        async fn execute(
            &self,
            _event: &HookEvent,
            _ctx: &HookContext,
        ) -> Result<HookOutcome, HookError> {
            Ok(self.outcome.clone())
        }
    }

    async fn build(
        llm: ScriptedLlm,
        config: AgentConfig,
    ) -> (AgenticLoop, Arc<InMemoryConversation>, Arc<CountingAuditor>) {
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(MockTool::new("grep"))).await;
        let deps = AgentDeps::new(Arc::new(llm), tools);
        let conversation = Arc::new(InMemoryConversation::new(100));
        let auditor = Arc::new(CountingAuditor::default());
        let agent = AgenticLoop::new(config, deps, conversation.clone())
            .with_auditor(auditor.clone());
        (agent, conversation, auditor)
    }

    #[tokio::test]
    async fn text_only_turn_ends_after_one_iteration_with_one_audit() {
        let (mut agent, conversation, auditor) =
            build(ScriptedLlm::new(vec![ScriptedLlm::text("hi there")]), AgentConfig::default()).await;

        let outcome = agent.process_user_message("hello").await;
        assert_eq!(
            outcome,
            LoopOutcome::Completed {
                response: "hi there".into(),
                iterations: 1
            }
        );
        assert_eq!(auditor.0.load(Ordering::SeqCst), 1);
        assert_eq!(agent.state(), LoopState::Idle);
        assert_eq!(conversation.len().await, 2);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back() {
        let (mut agent, conversation, _) = build(
            ScriptedLlm::new(vec![
                ScriptedLlm::tool_call("c1", "grep", r#"{"pattern":"fn"}"#),
                ScriptedLlm::text("found it"),
            ]),
            AgentConfig::default(),
        )
        .await;

        let outcome = agent.process_user_message("search").await;
        assert_eq!(outcome.iterations(), 2);

        let messages = conversation.messages().await;
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn budget_exhaustion_keeps_committed_turns() {
        let config = AgentConfig {
            max_iterations: Some(1),
            ..AgentConfig::default()
        };
        let (mut agent, conversation, auditor) = build(
            ScriptedLlm::new(vec![ScriptedLlm::tool_call("c1", "grep", "{}")]),
            config,
        )
        .await;

        let outcome = agent.process_user_message("loop forever").await;
        assert_eq!(outcome, LoopOutcome::MaxIterationsReached { iterations: 1 });
        assert_eq!(agent.state(), LoopState::MaxIterationsReached);
        assert_eq!(conversation.len().await, 3);
        assert_eq!(auditor.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn model_failure_is_recorded_not_propagated() {
        let (mut agent, conversation, auditor) =
            build(ScriptedLlm::new(vec![]), AgentConfig::default()).await;

        let outcome = agent.process_user_message("hello").await;
        assert!(matches!(outcome, LoopOutcome::Errored { iterations: 1, .. }));
        assert_eq!(agent.state(), LoopState::Errored);

        let last = conversation.messages().await.pop().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.content.starts_with("Error: "));
        assert_eq!(auditor.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn injected_message_continues_the_loop() {
        let (mut agent, conversation, _) = build(
            ScriptedLlm::new(vec![ScriptedLlm::text("draft"), ScriptedLlm::text("final")]),
            AgentConfig::default(),
        )
        .await;
        agent
            .executor
            .hooks()
            .register(Arc::new(NudgeOnce(AtomicBool::new(false))))
            .await;

        let outcome = agent.process_user_message("answer").await;
        assert_eq!(
            outcome,
            LoopOutcome::Completed {
                response: "final".into(),
                iterations: 2
            }
        );
        let messages = conversation.messages().await;
        assert_eq!(messages[2].content, "double-check your answer");
    }

    #[tokio::test]
    async fn vetoed_tool_halts_the_loop() {
        let (mut agent, _conversation, _) = build(
            ScriptedLlm::new(vec![ScriptedLlm::tool_call("c1", "grep", "{}")]),
            AgentConfig::default(),
        )
        .await;
        agent.executor.hooks().register(Arc::new(BlockAll)).await;

        let outcome = agent.process_user_message("search").await;
        assert_eq!(
            outcome,
            LoopOutcome::Halted {
                reason: "tools disabled".into(),
                iterations: 1
            }
        );
        assert_eq!(agent.state(), LoopState::Halted);
    }

    #[tokio::test]
    async fn system_prompt_added_once() {
        let config = AgentConfig {
            system_prompt: Some("You are terse.".into()),
            ..AgentConfig::default()
        };
        let (mut agent, conversation, _) = build(
            ScriptedLlm::new(vec![ScriptedLlm::text("a"), ScriptedLlm::text("b")]),
            config,
        )
        .await;

        agent.process_user_message("one").await;
        agent.process_user_message("two").await;

        let systems = conversation
            .messages()
            .await
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(systems, 1);
    }

    #[tokio::test]
    async fn manager_adds_delegation_tools_to_loop_only() {
        let base = Arc::new(ToolRegistry::new());
        let llm: Arc<dyn crate::llm::LlmProvider> = Arc::new(ScriptedLlm::new(vec![]));
        let deps = AgentDeps::new(llm, Arc::clone(&base));
        let manager = Arc::new(SubAgentManager::new(
            crate::worker::SubAgentQueue::new(1).unwrap(),
            deps.clone(),
            crate::config::SubAgentDefaults::default(),
        ));

        let agent = AgenticLoop::new(
            AgentConfig::default(),
            deps,
            Arc::new(InMemoryConversation::new(10)),
        )
        .with_manager(manager)
        .await;

        assert!(agent.tools().has("spawn_agent").await);
        assert!(agent.tools().has("agent_status").await);
        assert!(!base.has("spawn_agent").await);
    }

    #[tokio::test]
    async fn model_failure_reports_the_failing_iteration() {
        let (mut agent, _conversation, _) = build(
            ScriptedLlm::new(vec![ScriptedLlm::tool_call("c1", "grep", "{}")]),
            AgentConfig::default(),
        )
        .await;

        let outcome = agent.process_user_message("search").await;
        assert!(matches!(outcome, LoopOutcome::Errored { .. }));
        assert_eq!(outcome.iterations(), 2);
    }

    #[tokio::test]
    async fn response_veto_answers_requested_tool_calls() {
        let (mut agent, conversation, _) = build(
            ScriptedLlm::new(vec![ScriptedLlm::tool_call("c1", "grep", "{}")]),
            AgentConfig::default(),
        )
        .await;
        agent
            .executor
            .hooks()
            .register(Arc::new(FixedHook {
                point: HookPoint::AfterAssistantResponse,
                outcome: HookOutcome::veto("stop"),
            }))
            .await;

        let outcome = agent.process_user_message("search").await;
        assert_eq!(
            outcome,
            LoopOutcome::Halted {
                reason: "stop".into(),
                iterations: 1
            }
        );

        let messages = conversation.messages().await;
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
        assert!(messages[2].content.contains("not executed, loop halted: stop"));
    }

    #[tokio::test]
    async fn exhausted_budget_skips_tick_injection() {
        let config = AgentConfig {
            max_iterations: Some(1),
            ..AgentConfig::default()
        };
        let (mut agent, conversation, _) = build(
            ScriptedLlm::new(vec![ScriptedLlm::tool_call("c1", "grep", "{}")]),
            config,
        )
        .await;
        agent
            .executor
            .hooks()
            .register(Arc::new(FixedHook {
                point: HookPoint::IterationTick,
                outcome: HookOutcome::inject("keep going"),
            }))
            .await;

        let outcome = agent.process_user_message("search").await;
        assert_eq!(outcome, LoopOutcome::MaxIterationsReached { iterations: 1 });

        let messages = conversation.messages().await;
        let nudges = messages.iter().filter(|m| m.content == "keep going").count();
        assert_eq!(nudges, 1);
        assert_eq!(messages.last().map(|m| m.role), Some(Role::Tool));
    }

    #[tokio::test]
    async fn from_config_trims_history_to_configured_cap() {
        let config = AgentConfig {
            max_history_messages: 2,
            ..AgentConfig::default()
        };
        let deps = AgentDeps::new(
            Arc::new(ScriptedLlm::new(vec![
                ScriptedLlm::text("a"),
                ScriptedLlm::text("b"),
            ])),
            Arc::new(ToolRegistry::new()),
        );
        let mut agent = AgenticLoop::from_config(config, deps);

        agent.process_user_message("one").await;
        agent.process_user_message("two").await;

        let messages = agent.conversation().messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "two");
        assert_eq!(messages[1].content, "b");
    }
}
