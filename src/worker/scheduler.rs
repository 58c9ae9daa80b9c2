//! Sub-agent scheduler: bounded concurrency with FIFO admission.
//!
//! All scheduler state is owned by one actor task. Callers talk to it over a
//! command channel; each admitted worker runs in its own task, supervised by
//! a second task that turns a panic into a failed result and reports the
//! completion back through the same channel. On every enqueue and every
//! completion the actor admits from the head of the pending list while the
//! active set is below capacity.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::worker::events::{DEFAULT_EVENT_CAPACITY, LifecycleEvent, emit};
use crate::worker::state::SubAgentResult;
use crate::worker::subagent::SubAgent;

/// Snapshot of scheduler occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active: usize,
    pub pending: usize,
    pub capacity: usize,
    pub completed: usize,
}

enum Command {
    Enqueue {
        agent: SubAgent,
        done: oneshot::Sender<SubAgentResult>,
        ack: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Finished {
        id: Uuid,
        result: SubAgentResult,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
    Completed {
        id: Uuid,
        reply: oneshot::Sender<Option<SubAgentResult>>,
    },
    Shutdown,
}

struct PendingEntry {
    agent: SubAgent,
    done: oneshot::Sender<SubAgentResult>,
}

struct SchedulerState {
    capacity: usize,
    pending: VecDeque<PendingEntry>,
    active: HashMap<Uuid, oneshot::Sender<SubAgentResult>>,
    /// Append-only: a result is inserted once and never replaced.
    completed: HashMap<Uuid, SubAgentResult>,
    accepting: bool,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl SchedulerState {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            active: self.active.len(),
            pending: self.pending.len(),
            capacity: self.capacity,
            completed: self.completed.len(),
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { agent, done, ack } => {
                if !self.accepting {
                    let _ = ack.send(Err(SchedulerError::ShuttingDown));
                    return;
                }
                let id = agent.id();
                self.pending.push_back(PendingEntry { agent, done });
                let _ = ack.send(Ok(()));
                tracing::debug!(
                    agent_id = %id,
                    position = self.pending.len(),
                    "Sub-agent queued"
                );
                emit(
                    &self.events,
                    LifecycleEvent::Queued {
                        id,
                        position: self.pending.len(),
                        at: Utc::now(),
                    },
                );
                self.admit();
            }
            Command::Finished { id, result } => {
                self.finish(id, result);
                self.admit();
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Completed { id, reply } => {
                let _ = reply.send(self.completed.get(&id).cloned());
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    fn admit(&mut self) {
        while self.active.len() < self.capacity {
            let Some(PendingEntry { agent, done }) = self.pending.pop_front() else {
                break;
            };
            let id = agent.id();
            self.active.insert(id, done);
            debug_assert!(self.active.len() <= self.capacity);

            tracing::info!(
                agent_id = %id,
                active = self.active.len(),
                capacity = self.capacity,
                "Sub-agent admitted"
            );
            emit(&self.events, LifecycleEvent::Started { id, at: Utc::now() });

            let worker = tokio::spawn(agent.run(self.events.clone()));
            let commands = self.commands.upgrade();
            tokio::spawn(async move {
                let result = match worker.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        tracing::error!(agent_id = %id, "Sub-agent task panicked");
                        SubAgentResult::aborted(id, "sub-agent panicked")
                    }
                    Err(_) => SubAgentResult::aborted(id, "sub-agent task cancelled"),
                };
                match commands {
                    Some(tx) => {
                        let _ = tx.send(Command::Finished { id, result });
                    }
                    None => {
                        tracing::warn!(agent_id = %id, "Scheduler gone, dropping sub-agent result");
                    }
                }
            });
        }
    }

    fn finish(&mut self, id: Uuid, result: SubAgentResult) {
        let Some(done) = self.active.remove(&id) else {
            tracing::warn!(agent_id = %id, "Completion for unknown sub-agent");
            return;
        };

        let event = match &result.error {
            None => LifecycleEvent::Completed {
                id,
                iterations: result.iterations,
                at: Utc::now(),
            },
            Some(error) => LifecycleEvent::Failed {
                id,
                error: error.clone(),
                at: Utc::now(),
            },
        };
        emit(&self.events, event);

        self.completed.entry(id).or_insert_with(|| result.clone());
        let _ = done.send(result);
    }

    fn shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        let dropped = self.pending.len();
        for entry in self.pending.drain(..) {
            emit(
                &self.events,
                LifecycleEvent::Failed {
                    id: entry.agent.id(),
                    error: "cancelled before admission".to_string(),
                    at: Utc::now(),
                },
            );
        }
        tracing::info!(
            dropped,
            running = self.active.len(),
            "Scheduler shutting down"
        );
    }
}

/// Handle to the scheduler actor. Cheap to clone.
#[derive(Clone)]
pub struct SubAgentQueue {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl SubAgentQueue {
    /// Start a scheduler admitting at most `capacity` concurrent workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(capacity: usize) -> Result<Self, SchedulerError> {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self::with_events(capacity, events)
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::new(config.capacity)
    }

    /// Start a scheduler that publishes on an existing event channel.
    pub fn with_events(
        capacity: usize,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Result<Self, SchedulerError> {
        if capacity == 0 {
            return Err(SchedulerError::InvalidCapacity(capacity));
        }

        let (commands, mut rx) = mpsc::unbounded_channel();
        let mut state = SchedulerState {
            capacity,
            pending: VecDeque::new(),
            active: HashMap::new(),
            completed: HashMap::new(),
            accepting: true,
            commands: commands.downgrade(),
            events: events.clone(),
        };

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                state.handle(command);
            }
            tracing::debug!("Scheduler actor stopped");
        });

        Ok(Self {
            commands,
            events,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Append a worker to the pending list. The receiver resolves with its
    /// result once it has been admitted and finished; it errors if the entry
    /// is dropped by [`shutdown`](Self::shutdown) before admission.
    pub async fn add_to_queue(
        &self,
        agent: SubAgent,
    ) -> Result<oneshot::Receiver<SubAgentResult>, SchedulerError> {
        let (done, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Enqueue { agent, done, ack })
            .map_err(|_| SchedulerError::Stopped)?;
        ack_rx.await.map_err(|_| SchedulerError::Stopped)??;
        Ok(rx)
    }

    pub async fn status(&self) -> Result<QueueStatus, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Cached result of a finished worker.
    pub async fn completed(&self, id: Uuid) -> Result<Option<SubAgentResult>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Completed { id, reply })
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Stop admitting work. Pending entries are dropped; running workers
    /// finish normally.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
