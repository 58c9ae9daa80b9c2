//! Sub-agent system: isolated workers, bounded scheduling and management.
//!
//! Core components:
//! - `state`: status machine (queued → running ↔ waiting_for_input → completed/failed)
//! - `events`: lifecycle events broadcast to observers
//! - `subagent`: one worker loop with its inbox and progress snapshot
//! - `scheduler`: actor enforcing the concurrency bound with FIFO admission
//! - `manager`: spawn, message routing, wait / wait-all

pub mod events;
pub mod manager;
pub mod scheduler;
pub mod state;
pub mod subagent;

pub use events::LifecycleEvent;
pub use manager::SubAgentManager;
pub use scheduler::{QueueStatus, SubAgentQueue};
pub use state::{SubAgentProgress, SubAgentResult, SubAgentStatus};
pub use subagent::{InboundMessage, SubAgent, SubAgentConfig, SubAgentHandle};
