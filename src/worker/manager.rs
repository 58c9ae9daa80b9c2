//! Sub-agent manager: spawn, message routing and result collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::agent::executor::AgentDeps;
use crate::config::SubAgentDefaults;
use crate::error::{Result, SubAgentError};
use crate::worker::events::LifecycleEvent;
use crate::worker::scheduler::{QueueStatus, SubAgentQueue};
use crate::worker::state::{SubAgentProgress, SubAgentResult};
use crate::worker::subagent::{SubAgent, SubAgentConfig, SubAgentHandle};

type ResultFuture = Shared<BoxFuture<'static, Arc<SubAgentResult>>>;

struct ActiveAgent {
    handle: SubAgentHandle,
    result: ResultFuture,
}

#[derive(Default)]
struct Registry {
    active: HashMap<Uuid, ActiveAgent>,
    /// Written once per id, by whichever of the completion watcher or a
    /// waiter gets there first.
    completed: HashMap<Uuid, Arc<SubAgentResult>>,
}

/// Facade over the scheduler for the primary loop and delegation tools.
pub struct SubAgentManager {
    queue: SubAgentQueue,
    deps: AgentDeps,
    defaults: SubAgentDefaults,
    registry: Arc<RwLock<Registry>>,
}

impl SubAgentManager {
    pub fn new(queue: SubAgentQueue, deps: AgentDeps, defaults: SubAgentDefaults) -> Self {
        Self {
            queue,
            deps,
            defaults,
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub fn defaults(&self) -> &SubAgentDefaults {
        &self.defaults
    }

    /// Config for `task` using the manager's defaults.
    pub fn config_for(&self, task: impl Into<String>) -> SubAgentConfig {
        SubAgentConfig::from_defaults(task, &self.defaults)
    }

    /// Create a sub-agent and submit it to the scheduler.
    pub async fn spawn(&self, config: SubAgentConfig) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let (agent, handle) = SubAgent::new(id, config, self.deps.clone());

        let done = self.queue.add_to_queue(agent).await?;

        let result: ResultFuture = async move {
            let result = done
                .await
                .unwrap_or_else(|_| SubAgentResult::aborted(id, "cancelled before admission"));
            Arc::new(result)
        }
        .boxed()
        .shared();

        self.registry.write().await.active.insert(
            id,
            ActiveAgent {
                handle,
                result: result.clone(),
            },
        );

        // Move the id to the completed cache as soon as the result exists,
        // even if nobody waits for it.
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let result = result.await;
            Self::settle(&registry, id, result).await;
        });

        tracing::info!(agent_id = %id, "Spawned sub-agent");
        Ok(id)
    }

    /// Record a finished result once and return the cached `Arc`.
    async fn settle(
        registry: &RwLock<Registry>,
        id: Uuid,
        result: Arc<SubAgentResult>,
    ) -> Arc<SubAgentResult> {
        let mut registry = registry.write().await;
        registry.active.remove(&id);
        Arc::clone(registry.completed.entry(id).or_insert(result))
    }

    async fn handle(&self, id: Uuid) -> std::result::Result<SubAgentHandle, SubAgentError> {
        self.registry
            .read()
            .await
            .active
            .get(&id)
            .map(|a| a.handle.clone())
            .ok_or(SubAgentError::NotFound { id })
    }

    /// Queue a fire-and-forget message for an active sub-agent.
    pub async fn send_user_message(
        &self,
        id: Uuid,
        text: impl Into<String>,
    ) -> std::result::Result<(), SubAgentError> {
        self.handle(id).await?.notify(text)
    }

    /// Send a message and wait for the sub-agent's next answer.
    ///
    /// `timeout` defaults to the configured message timeout.
    pub async fn send_user_message_and_wait(
        &self,
        id: Uuid,
        text: impl Into<String>,
        timeout: Option<Duration>,
    ) -> std::result::Result<String, SubAgentError> {
        let timeout = timeout.unwrap_or(self.defaults.message_timeout);
        self.handle(id).await?.request(text, timeout).await
    }

    /// Wait for a sub-agent to finish. Every call for the same id returns the
    /// same `Arc`.
    pub async fn wait(&self, id: Uuid) -> std::result::Result<Arc<SubAgentResult>, SubAgentError> {
        let pending = {
            let registry = self.registry.read().await;
            if let Some(result) = registry.completed.get(&id) {
                return Ok(Arc::clone(result));
            }
            registry
                .active
                .get(&id)
                .map(|a| a.result.clone())
                .ok_or(SubAgentError::NotFound { id })?
        };

        let result = pending.await;
        Ok(Self::settle(&self.registry, id, result).await)
    }

    /// Wait for every id concurrently.
    pub async fn wait_all(
        &self,
        ids: &[Uuid],
    ) -> std::result::Result<HashMap<Uuid, Arc<SubAgentResult>>, SubAgentError> {
        let results = futures::future::join_all(ids.iter().map(|id| self.wait(*id))).await;
        ids.iter()
            .copied()
            .zip(results)
            .map(|(id, result)| result.map(|r| (id, r)))
            .collect()
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        Ok(self.queue.status().await?)
    }

    /// Latest progress snapshot for an active sub-agent.
    pub async fn progress(&self, id: Uuid) -> Option<SubAgentProgress> {
        self.registry
            .read()
            .await
            .active
            .get(&id)
            .map(|a| a.handle.progress())
    }

    /// Cached result for a finished sub-agent, if any.
    pub async fn result(&self, id: Uuid) -> Option<Arc<SubAgentResult>> {
        self.registry.read().await.completed.get(&id).cloned()
    }

    pub async fn active_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.registry.read().await.active.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.queue.subscribe()
    }

    /// Lifecycle events as a stream. Lagged receivers surface as errors.
    pub fn event_stream(&self) -> BroadcastStream<LifecycleEvent> {
        BroadcastStream::new(self.queue.subscribe())
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;
    use crate::tools::ToolRegistry;

    fn manager(llm: ScriptedLlm, capacity: usize) -> SubAgentManager {
        let deps = AgentDeps::new(Arc::new(llm), Arc::new(ToolRegistry::new()));
        SubAgentManager::new(
            SubAgentQueue::new(capacity).unwrap(),
            deps,
            SubAgentDefaults::default(),
        )
    }

    #[tokio::test]
    async fn wait_twice_returns_same_arc() {
        let manager = manager(ScriptedLlm::new(vec![ScriptedLlm::text("ok")]), 1);
        let id = manager.spawn(manager.config_for("task")).await.unwrap();

        let first = manager.wait(id).await.unwrap();
        let second = manager.wait(id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.output, "ok");
        assert!(manager.active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let manager = manager(ScriptedLlm::new(vec![]), 1);
        let id = Uuid::new_v4();
        assert!(matches!(
            manager.wait(id).await,
            Err(SubAgentError::NotFound { .. })
        ));
        assert!(matches!(
            manager.send_user_message(id, "hi").await,
            Err(SubAgentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn completed_agents_reject_messages() {
        let manager = manager(ScriptedLlm::new(vec![ScriptedLlm::text("ok")]), 1);
        let id = manager.spawn(manager.config_for("task")).await.unwrap();
        manager.wait(id).await.unwrap();

        assert!(matches!(
            manager.send_user_message(id, "late").await,
            Err(SubAgentError::NotFound { .. })
        ));
        assert!(manager.result(id).await.is_some());
    }

    #[tokio::test]
    async fn wait_all_collects_every_result() {
        let manager = manager(
            ScriptedLlm::new(vec![ScriptedLlm::text("a"), ScriptedLlm::text("b")]),
            2,
        );
        let a = manager.spawn(manager.config_for("a")).await.unwrap();
        let b = manager.spawn(manager.config_for("b")).await.unwrap();

        let results = manager.wait_all(&[b, a]).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.success));
    }
}
