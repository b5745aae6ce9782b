//! Job identity, lifecycle states and outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::action::{ActionError, ActionKind, ActionOutput};
use crate::cancel::CancelReason;
use crate::element::ElementRef;

/// Identifies a unit of work: one action applied to one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub element: ElementRef,
    pub action: ActionKind,
}

impl JobKey {
    pub fn new(element: impl Into<ElementRef>, action: ActionKind) -> Self {
        Self {
            element: element.into(),
            action,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action, self.element)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }

    /// Terminal states that cause dependents to be skipped.
    pub fn is_failure(self) -> bool {
        matches!(self, JobState::Failed | JobState::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Running -> Queued` is the retry path.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Queued)
                | (Waiting, Skipped)
                | (Waiting, Cancelled)
                | (Queued, Running)
                | (Queued, Skipped)
                | (Queued, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "WAITING",
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Skipped => "SKIPPED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result recorded for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobOutcome {
    Success(ActionOutput),
    Failed(ActionError),
    Cancelled(CancelReason),
    /// Never ran because `cause` failed or was cancelled.
    Skipped { cause: JobKey },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Success(_) => JobState::Success,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled(_) => JobState::Cancelled,
            JobOutcome::Skipped { .. } => JobState::Skipped,
        }
    }

    /// Short human readable description, used as event detail.
    pub fn describe(&self) -> Option<String> {
        match self {
            JobOutcome::Success(output) => output.detail.clone(),
            JobOutcome::Failed(error) => Some(error.to_string()),
            JobOutcome::Cancelled(reason) => Some(reason.to_string()),
            JobOutcome::Skipped { cause } => Some(format!("dependency {} did not succeed", cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 7] = [
        JobState::Waiting,
        JobState::Queued,
        JobState::Running,
        JobState::Success,
        JobState::Failed,
        JobState::Skipped,
        JobState::Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{} -> {} should be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_running_only_reachable_from_queued() {
        for from in ALL {
            assert_eq!(
                from.can_transition_to(JobState::Running),
                from == JobState::Queued
            );
        }
    }

    #[test]
    fn test_skip_only_before_dispatch() {
        assert!(JobState::Waiting.can_transition_to(JobState::Skipped));
        assert!(JobState::Queued.can_transition_to(JobState::Skipped));
        assert!(!JobState::Running.can_transition_to(JobState::Skipped));
    }

    #[test]
    fn test_job_key_display() {
        let key = JobKey::new("base/alpine", ActionKind::Build);
        assert_eq!(key.to_string(), "build:base/alpine");
    }
}
