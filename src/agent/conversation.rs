//! Conversation history collaborator.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::AgentConfig;
use crate::llm::{ChatMessage, Role};

/// Ordered message history owned by one loop.
#[async_trait]
pub trait Conversation: Send + Sync {
    async fn append(&self, message: ChatMessage);

    async fn messages(&self) -> Vec<ChatMessage>;

    /// Trim history after a completed exchange.
    async fn compress(&self);
}

/// In-memory history capped at a fixed number of messages.
///
/// Trimming drops the oldest non-system messages first and never leaves a
/// tool result at the head of the remaining history, since it would no
/// longer follow the assistant message that requested it.
pub struct InMemoryConversation {
    messages: RwLock<Vec<ChatMessage>>,
    max_messages: usize,
}

impl InMemoryConversation {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            max_messages: max_messages.max(1),
        }
    }

    pub fn with_system_prompt(max_messages: usize, prompt: impl Into<String>) -> Self {
        Self {
            messages: RwLock::new(vec![ChatMessage::system(prompt)]),
            max_messages: max_messages.max(1),
        }
    }

    /// History capped at `config.max_history_messages`, seeded with the
    /// configured system prompt if any.
    pub fn from_config(config: &AgentConfig) -> Self {
        match &config.system_prompt {
            Some(prompt) => Self::with_system_prompt(config.max_history_messages, prompt.clone()),
            None => Self::new(config.max_history_messages),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl Conversation for InMemoryConversation {
    async fn append(&self, message: ChatMessage) {
        self.messages.write().await.push(message);
    }

    async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.read().await.clone()
    }

    async fn compress(&self) {
        let mut messages = self.messages.write().await;
        if messages.len() <= self.max_messages {
            return;
        }

        let (system, mut rest): (Vec<ChatMessage>, Vec<ChatMessage>) =
            messages.drain(..).partition(|m| m.role == Role::System);

        let budget = self.max_messages.saturating_sub(system.len());
        let excess = rest.len().saturating_sub(budget);
        rest.drain(..excess);

        let orphans = rest.iter().take_while(|m| m.role == Role::Tool).count();
        rest.drain(..orphans);

        tracing::debug!(
            dropped = excess + orphans,
            kept = system.len() + rest.len(),
            "Compressed conversation history"
        );

        messages.extend(system);
        messages.extend(rest);
    }
}
