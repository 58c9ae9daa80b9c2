//! Sub-agent state machine, progress snapshots and results.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SubAgentError;

/// Lifecycle status of a sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    /// Waiting for an active slot.
    Queued,
    /// Admitted and iterating.
    Running,
    /// Finished a turn with nothing to do, idle until input or grace expiry.
    WaitingForInput,
    /// Ended normally.
    Completed,
    /// Ended with an error, cap exhaustion or cancellation.
    Failed,
}

impl SubAgentStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: SubAgentStatus) -> bool {
        use SubAgentStatus::*;

        matches!(
            (self, target),
            // From Queued (Failed = cancelled before admission)
            (Queued, Running) | (Queued, Failed) |
            // From Running
            (Running, WaitingForInput) | (Running, Completed) | (Running, Failed) |
            // From WaitingForInput
            (WaitingForInput, Running) | (WaitingForInput, Completed) |
            (WaitingForInput, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for SubAgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SubAgentStatus,
    pub to: SubAgentStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Worker-internal run state with transition history.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentState {
    pub id: Uuid,
    pub status: SubAgentStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl SubAgentState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: SubAgentStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        target: SubAgentStatus,
        reason: Option<String>,
    ) -> Result<(), SubAgentError> {
        if !self.status.can_transition_to(target) {
            return Err(SubAgentError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.status,
            to: target,
            timestamp: Utc::now(),
            reason,
        });

        // Cap transition history; input rounds can bounce indefinitely.
        const MAX_TRANSITIONS: usize = 200;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = target;

        match target {
            SubAgentStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            SubAgentStatus::Completed | SubAgentStatus::Failed => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }
}

/// Point-in-time view of a sub-agent, published after every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentProgress {
    pub id: Uuid,
    pub status: SubAgentStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Distinct tool names invoked so far, sorted.
    pub tools_used: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SubAgentProgress {
    pub fn queued(id: Uuid, max_iterations: u32) -> Self {
        Self {
            id,
            status: SubAgentStatus::Queued,
            iteration: 0,
            max_iterations,
            tools_used: Vec::new(),
            started_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Final record of a sub-agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub id: Uuid,
    pub success: bool,
    /// Final assistant text (empty on failure).
    pub output: String,
    pub iterations: u32,
    /// Distinct tool names invoked, sorted.
    pub tools_used: Vec<String>,
    /// Last assistant text produced before a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SubAgentResult {
    pub fn completed(
        id: Uuid,
        output: String,
        iterations: u32,
        tools_used: &BTreeSet<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            success: true,
            output,
            iterations,
            tools_used: tools_used.iter().cloned().collect(),
            partial_output: None,
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        id: Uuid,
        error: impl Into<String>,
        partial_output: Option<String>,
        iterations: u32,
        tools_used: &BTreeSet<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            success: false,
            output: String::new(),
            iterations,
            tools_used: tools_used.iter().cloned().collect(),
            partial_output: partial_output.filter(|p| !p.is_empty()),
            error: Some(error.into()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Failure recorded for a worker that never produced a result (panic or
    /// cancellation).
    pub fn aborted(id: Uuid, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self::failed(id, error, None, 0, &BTreeSet::new(), now)
    }

    pub fn status(&self) -> SubAgentStatus {
        if self.success {
            SubAgentStatus::Completed
        } else {
            SubAgentStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        use SubAgentStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(WaitingForInput));
        assert!(WaitingForInput.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(WaitingForInput.can_transition_to(Completed));
    }

    #[test]
    fn terminal_states_are_final() {
        use SubAgentStatus::*;
        for target in [Queued, Running, WaitingForInput, Completed, Failed] {
            assert!(!Completed.can_transition_to(target));
            assert!(!Failed.can_transition_to(target));
        }
        assert!(!Queued.can_transition_to(Completed));
        assert!(Completed.is_terminal());
        assert!(!WaitingForInput.is_terminal());
    }

    #[test]
    fn state_tracks_timestamps() {
        let mut state = SubAgentState::new(Uuid::new_v4());
        state.transition_to(SubAgentStatus::Running, None).unwrap();
        assert!(state.started_at.is_some());
        state
            .transition_to(SubAgentStatus::Completed, Some("done".into()))
            .unwrap();
        assert!(state.finished_at.is_some());
        assert_eq!(state.transitions.len(), 2);

        let err = state
            .transition_to(SubAgentStatus::Running, None)
            .unwrap_err();
        assert!(matches!(err, SubAgentError::InvalidTransition { .. }));
    }

    #[test]
    fn transition_history_capped() {
        let mut state = SubAgentState::new(Uuid::new_v4());
        state.transition_to(SubAgentStatus::Running, None).unwrap();
        for _ in 0..150 {
            state
                .transition_to(SubAgentStatus::WaitingForInput, None)
                .unwrap();
            state.transition_to(SubAgentStatus::Running, None).unwrap();
        }
        assert!(state.transitions.len() <= 200);
    }

    #[test]
    fn status_display_and_serde() {
        assert_eq!(SubAgentStatus::WaitingForInput.to_string(), "waiting_for_input");
        let json = serde_json::to_string(&SubAgentStatus::WaitingForInput).unwrap();
        assert_eq!(json, "\"waiting_for_input\"");
    }

    #[test]
    fn failed_result_drops_empty_partial_output() {
        let id = Uuid::new_v4();
        let result =
            SubAgentResult::failed(id, "boom", Some(String::new()), 2, &BTreeSet::new(), Utc::now());
        assert!(result.partial_output.is_none());
        assert_eq!(result.status(), SubAgentStatus::Failed);
    }
}
