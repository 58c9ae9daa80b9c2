//! Agent module: the primary loop, its conversation and the turn protocol.

pub mod agentic_loop;
pub mod conversation;
pub mod delegation;
pub mod executor;

pub use agentic_loop::{AgenticLoop, LoopAuditor, LoopOutcome, LoopState, NoopAuditor};
pub use conversation::{Conversation, InMemoryConversation};
pub use executor::{AgentDeps, TurnExecutor};
