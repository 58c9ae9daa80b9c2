//! Sub-agent lifecycle events.
//!
//! Broadcast by the scheduler and by running workers. Delivery is best effort:
//! a send with no subscribers, or to a lagging subscriber, is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::worker::state::SubAgentStatus;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Added to the pending list.
    Queued {
        id: Uuid,
        position: usize,
        at: DateTime<Utc>,
    },
    /// Admitted to an active slot.
    Started { id: Uuid, at: DateTime<Utc> },
    /// One turn finished.
    Progress {
        id: Uuid,
        status: SubAgentStatus,
        iteration: u32,
        max_iterations: u32,
        at: DateTime<Utc>,
    },
    Completed {
        id: Uuid,
        iterations: u32,
        at: DateTime<Utc>,
    },
    Failed {
        id: Uuid,
        error: String,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// Get the sub-agent ID from any variant.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Queued { id, .. }
            | Self::Started { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Send without caring whether anyone is listening.
pub(crate) fn emit(tx: &broadcast::Sender<LifecycleEvent>, event: LifecycleEvent) {
    tracing::trace!(id = %event.id(), event = ?event, "Lifecycle event");
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let id = Uuid::new_v4();
        let event = LifecycleEvent::Started { id, at: Utc::now() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "started");
        assert_eq!(json["id"], id.to_string());
        assert!(!event.is_terminal());
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        emit(
            &tx,
            LifecycleEvent::Failed {
                id: Uuid::new_v4(),
                error: "x".into(),
                at: Utc::now(),
            },
        );
    }
}
