//! Sub-agent worker: one isolated loop with a private conversation.
//!
//! A sub-agent runs the same turn protocol as the primary loop, against its
//! own history and iteration cap. Messages addressed to it are queued on an
//! unbounded inbox and only drained at turn boundaries, before each model
//! request. A synchronous request carries a correlation id and a reply
//! channel; it is answered with the text of the next assistant turn.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::agent::executor::{AgentDeps, TurnExecutor, unexecuted_results};
use crate::config::SubAgentDefaults;
use crate::error::SubAgentError;
use crate::hooks::{HookContext, HookEvent};
use crate::llm::ChatMessage;
use crate::worker::events::{LifecycleEvent, emit};
use crate::worker::state::{SubAgentProgress, SubAgentResult, SubAgentState, SubAgentStatus};

const ITERATION_CAP_ERROR: &str = "iteration cap reached";

/// What to run and under which limits.
#[derive(Debug, Clone)]
pub struct SubAgentConfig {
    /// Initial user message.
    pub task: String,
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    /// How long to stay in `waiting_for_input` after a natural end.
    pub input_grace: Duration,
}

impl SubAgentConfig {
    pub fn new(task: impl Into<String>) -> Self {
        Self::from_defaults(task, &SubAgentDefaults::default())
    }

    pub fn from_defaults(task: impl Into<String>, defaults: &SubAgentDefaults) -> Self {
        Self {
            task: task.into(),
            system_prompt: None,
            max_iterations: defaults.max_iterations.max(1),
            input_grace: defaults.input_grace,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_input_grace(mut self, grace: Duration) -> Self {
        self.input_grace = grace;
        self
    }
}

/// A message addressed to a running sub-agent.
#[derive(Debug)]
pub enum InboundMessage {
    /// Fire-and-forget: appended as the next user turn.
    Notify { text: String },
    /// Answered with the next assistant turn's text.
    Request {
        correlation_id: Uuid,
        text: String,
        reply: oneshot::Sender<String>,
    },
}

/// Caller-side handle for addressing and observing a sub-agent.
#[derive(Clone)]
pub struct SubAgentHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<InboundMessage>,
    progress: watch::Receiver<SubAgentProgress>,
}

impl SubAgentHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message without waiting for an answer.
    pub fn notify(&self, text: impl Into<String>) -> Result<(), SubAgentError> {
        self.tx
            .send(InboundMessage::Notify { text: text.into() })
            .map_err(|_| SubAgentError::Closed { id: self.id })
    }

    /// Queue a correlated request and return its reply channel.
    pub fn send_request(
        &self,
        text: impl Into<String>,
    ) -> Result<(Uuid, oneshot::Receiver<String>), SubAgentError> {
        let correlation_id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(InboundMessage::Request {
                correlation_id,
                text: text.into(),
                reply,
            })
            .map_err(|_| SubAgentError::Closed { id: self.id })?;
        Ok((correlation_id, rx))
    }

    /// Send a request and wait up to `timeout` for the answer.
    ///
    /// On timeout the message stays delivered and the sub-agent is unaffected;
    /// only this caller stops waiting.
    pub async fn request(
        &self,
        text: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, SubAgentError> {
        let (correlation_id, rx) = self.send_request(text)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(SubAgentError::Closed { id: self.id }),
            Err(_) => {
                tracing::debug!(
                    agent_id = %self.id,
                    correlation_id = %correlation_id,
                    "Synchronous request timed out"
                );
                Err(SubAgentError::Timeout {
                    id: self.id,
                    timeout,
                })
            }
        }
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> SubAgentProgress {
        self.progress.borrow().clone()
    }

    pub fn watch_progress(&self) -> watch::Receiver<SubAgentProgress> {
        self.progress.clone()
    }

    /// True once the worker has stopped reading its inbox.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One sub-agent run. Consumed by [`SubAgent::run`].
pub struct SubAgent {
    id: Uuid,
    config: SubAgentConfig,
    executor: TurnExecutor,
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
    progress_tx: watch::Sender<SubAgentProgress>,
    state: SubAgentState,
}

/// Mutable bookkeeping for one run.
struct RunState {
    messages: Vec<ChatMessage>,
    pending_replies: HashMap<Uuid, oneshot::Sender<String>>,
    tools_used: BTreeSet<String>,
    iteration: u32,
    last_content: Option<String>,
}

impl SubAgent {
    pub fn new(id: Uuid, config: SubAgentConfig, deps: AgentDeps) -> (Self, SubAgentHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) =
            watch::channel(SubAgentProgress::queued(id, config.max_iterations));

        let agent = Self {
            id,
            config,
            executor: TurnExecutor::new(deps),
            inbox,
            progress_tx,
            state: SubAgentState::new(id),
        };
        let handle = SubAgentHandle {
            id,
            tx,
            progress: progress_rx,
        };
        (agent, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SubAgentStatus {
        self.state.status
    }

    /// Run until the sub-agent completes or fails.
    pub async fn run(mut self, events: broadcast::Sender<LifecycleEvent>) -> SubAgentResult {
        let started_at = Utc::now();
        self.transition(SubAgentStatus::Running, None);
        tracing::info!(
            agent_id = %self.id,
            max_iterations = self.config.max_iterations,
            "Sub-agent starting"
        );

        let mut run = RunState {
            messages: Vec::new(),
            pending_replies: HashMap::new(),
            tools_used: BTreeSet::new(),
            iteration: 0,
            last_content: None,
        };
        if let Some(prompt) = &self.config.system_prompt {
            run.messages.push(ChatMessage::system(prompt.clone()));
        }
        run.messages.push(ChatMessage::user(self.config.task.clone()));

        let result = self.execution_loop(&mut run, &events).await;

        let final_status = result.status();
        self.transition(final_status, result.error.clone());
        self.publish(&run, &events);

        if !run.pending_replies.is_empty() {
            tracing::debug!(
                agent_id = %self.id,
                dropped = run.pending_replies.len(),
                "Sub-agent finished with unanswered requests"
            );
        }

        match &result.error {
            None => tracing::info!(
                agent_id = %self.id,
                iterations = result.iterations,
                "Sub-agent completed"
            ),
            Some(error) => tracing::warn!(
                agent_id = %self.id,
                iterations = result.iterations,
                error = %error,
                "Sub-agent failed"
            ),
        }

        SubAgentResult { started_at, ..result }
    }

    async fn execution_loop(
        &mut self,
        run: &mut RunState,
        events: &broadcast::Sender<LifecycleEvent>,
    ) -> SubAgentResult {
        let hooks = std::sync::Arc::clone(self.executor.hooks());

        loop {
            self.drain_inbox(run);

            if run.iteration >= self.config.max_iterations {
                return self.fail(run, ITERATION_CAP_ERROR);
            }
            run.iteration += 1;

            let ctx = HookContext {
                agent_id: self.id.to_string(),
                iteration: run.iteration,
            };

            let tick = hooks
                .run(HookEvent::IterationTick { iteration: run.iteration }, &ctx)
                .await;
            let mut injections = tick.injections;
            if let Some(reason) = tick.veto {
                return self.fail(run, format!("halted by hook: {reason}"));
            }

            let submit = hooks
                .run(
                    HookEvent::PromptSubmit {
                        message_count: run.messages.len(),
                    },
                    &ctx,
                )
                .await;
            injections.extend(submit.injections);
            if let Some(reason) = submit.veto {
                return self.fail(run, format!("halted by hook: {reason}"));
            }

            let turn = match self.executor.model_turn(&run.messages).await {
                Ok(turn) => turn,
                Err(e) => return self.fail(run, e.to_string()),
            };

            if !turn.content.is_empty() {
                run.last_content = Some(turn.content.clone());
                for (correlation_id, reply) in run.pending_replies.drain() {
                    tracing::debug!(
                        agent_id = %self.id,
                        correlation_id = %correlation_id,
                        "Answering correlated request"
                    );
                    let _ = reply.send(turn.content.clone());
                }
            }

            if turn.has_tool_calls() {
                run.messages.push(ChatMessage::assistant_with_tool_calls(
                    turn.content.clone(),
                    turn.tool_calls.clone(),
                ));
            } else {
                run.messages.push(ChatMessage::assistant(turn.content.clone()));
            }

            let response = hooks
                .run(
                    HookEvent::AssistantResponse {
                        content: turn.content.clone(),
                        tool_call_count: turn.tool_calls.len(),
                    },
                    &ctx,
                )
                .await;
            injections.extend(response.injections);
            if let Some(reason) = response.veto {
                run.messages.extend(unexecuted_results(&turn.tool_calls, &reason));
                return self.fail(run, format!("halted by hook: {reason}"));
            }

            if turn.has_tool_calls() {
                let phase = self
                    .executor
                    .run_tool_calls(&ctx, &turn.tool_calls, &mut run.tools_used)
                    .await;
                run.messages.extend(phase.results);
                injections.extend(phase.injections);
                Self::inject(run, injections);
                self.publish(run, events);

                if let Some(reason) = phase.halted {
                    return self.fail(run, format!("halted by hook: {reason}"));
                }
                continue;
            }

            let injected = !injections.is_empty();
            Self::inject(run, injections);
            self.publish(run, events);

            if injected || self.drain_inbox(run) > 0 {
                continue;
            }

            if self.await_input(run, events).await {
                continue;
            }

            return SubAgentResult::completed(
                self.id,
                turn.content,
                run.iteration,
                &run.tools_used,
                Utc::now(),
            );
        }
    }

    /// Idle in `waiting_for_input` for the configured grace period. Returns
    /// true if a message arrived and the run resumes.
    async fn await_input(
        &mut self,
        run: &mut RunState,
        events: &broadcast::Sender<LifecycleEvent>,
    ) -> bool {
        if self.config.input_grace.is_zero() {
            return false;
        }

        self.transition(SubAgentStatus::WaitingForInput, None);
        self.publish(run, events);

        match tokio::time::timeout(self.config.input_grace, self.inbox.recv()).await {
            Ok(Some(message)) => {
                self.accept(run, message);
                self.transition(SubAgentStatus::Running, Some("input received".into()));
                true
            }
            Ok(None) | Err(_) => false,
        }
    }

    /// Move every queued message into the conversation.
    fn drain_inbox(&mut self, run: &mut RunState) -> usize {
        let mut drained = 0;
        while let Ok(message) = self.inbox.try_recv() {
            self.accept(run, message);
            drained += 1;
        }
        drained
    }

    fn accept(&self, run: &mut RunState, message: InboundMessage) {
        match message {
            InboundMessage::Notify { text } => {
                tracing::debug!(agent_id = %self.id, "Received notification");
                run.messages.push(ChatMessage::user(text));
            }
            InboundMessage::Request {
                correlation_id,
                text,
                reply,
            } => {
                tracing::debug!(
                    agent_id = %self.id,
                    correlation_id = %correlation_id,
                    "Received correlated request"
                );
                run.messages.push(ChatMessage::user(text));
                run.pending_replies.insert(correlation_id, reply);
            }
        }
    }

    fn inject(run: &mut RunState, injections: Vec<String>) {
        run.messages
            .extend(injections.into_iter().map(ChatMessage::user));
    }

    fn fail(&self, run: &RunState, error: impl Into<String>) -> SubAgentResult {
        SubAgentResult::failed(
            self.id,
            error,
            run.last_content.clone(),
            run.iteration,
            &run.tools_used,
            Utc::now(),
        )
    }

    fn transition(&mut self, target: SubAgentStatus, reason: Option<String>) {
        if let Err(e) = self.state.transition_to(target, reason) {
            tracing::warn!(agent_id = %self.id, error = %e, "Ignoring invalid status transition");
        }
    }

    fn publish(&self, run: &RunState, events: &broadcast::Sender<LifecycleEvent>) {
        let snapshot = SubAgentProgress {
            id: self.id,
            status: self.state.status,
            iteration: run.iteration,
            max_iterations: self.config.max_iterations,
            tools_used: run.tools_used.iter().cloned().collect(),
            started_at: self.state.started_at,
            updated_at: Utc::now(),
        };
        emit(
            events,
            LifecycleEvent::Progress {
                id: self.id,
                status: snapshot.status,
                iteration: snapshot.iteration,
                max_iterations: snapshot.max_iterations,
                at: snapshot.updated_at,
            },
        );
        self.progress_tx.send_replace(snapshot);
    }
}
