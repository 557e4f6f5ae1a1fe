//! Inbox record lifecycle state machine.
//!
//! ```text
//! accepted → triaged → {classifying →} dispatching → completed
//!                │                          │
//!                └──(drop)──► completed     └──► failed ──► dead_lettered
//!                                                  │
//!                                                  └──(retries remain)──► dispatching
//! ```
//!
//! `completed` and `dead_lettered` are terminal. Transitions never regress;
//! the store enforces this a second time with a conditional UPDATE on
//! `(request_id, lifecycle_state)`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Accepted,
    Triaged,
    Classifying,
    Dispatching,
    Completed,
    Failed,
    DeadLettered,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Accepted => "accepted",
            LifecycleState::Triaged => "triaged",
            LifecycleState::Classifying => "classifying",
            LifecycleState::Dispatching => "dispatching",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
            LifecycleState::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(LifecycleState::Accepted),
            "triaged" => Some(LifecycleState::Triaged),
            "classifying" => Some(LifecycleState::Classifying),
            "dispatching" => Some(LifecycleState::Dispatching),
            "completed" => Some(LifecycleState::Completed),
            "failed" => Some(LifecycleState::Failed),
            "dead_lettered" => Some(LifecycleState::DeadLettered),
            _ => None,
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::DeadLettered)
    }

    /// Legal forward transitions. `failed → dispatching` covers a retry with
    /// budget remaining; `triaged → completed` covers a triage `drop` action.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Accepted, Triaged)
                | (Triaged, Classifying)
                | (Triaged, Dispatching)
                | (Triaged, Completed)
                | (Classifying, Dispatching)
                | (Dispatching, Completed)
                | (Dispatching, Failed)
                | (Failed, Dispatching)
                | (Failed, DeadLettered)
        )
    }

    /// Validate a transition, returning the error callers persist and alert on.
    pub fn transition_to(&self, next: LifecycleState) -> Result<LifecycleState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: *self, to: next })
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a lifecycle move is illegal. Callers must treat this as an
/// inconsistency alert, not as a routine error to swallow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal lifecycle transition: {} -> {}",
            self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;

    #[test]
    fn happy_path_is_legal() {
        assert!(Accepted.can_transition_to(Triaged));
        assert!(Triaged.can_transition_to(Classifying));
        assert!(Classifying.can_transition_to(Dispatching));
        assert!(Dispatching.can_transition_to(Completed));
    }

    #[test]
    fn short_circuit_skips_classifier() {
        assert!(Triaged.can_transition_to(Dispatching));
    }

    #[test]
    fn terminal_states_never_move() {
        for next in [Accepted, Triaged, Classifying, Dispatching, Completed, Failed, DeadLettered] {
            assert!(!Completed.can_transition_to(next));
            assert!(!DeadLettered.can_transition_to(next));
        }
        assert!(Completed.is_terminal());
        assert!(DeadLettered.is_terminal());
    }

    #[test]
    fn failed_retries_or_dead_letters() {
        assert!(Failed.can_transition_to(Dispatching));
        assert!(Failed.can_transition_to(DeadLettered));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn no_regressions() {
        assert!(!Dispatching.can_transition_to(Triaged));
        assert!(!Triaged.can_transition_to(Accepted));
        let err = Dispatching.transition_to(Accepted).unwrap_err();
        assert_eq!(err.from, Dispatching);
        assert_eq!(err.to, Accepted);
    }
}
