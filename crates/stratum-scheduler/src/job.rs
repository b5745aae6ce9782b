//! A job as tracked by the scheduler.

use stratum_core::{Error, JobId, JobKey, JobOutcome, JobState, Result};

/// One entry in a run's job table.
///
/// Only the scheduling loop touches a `Job`. Executors see an immutable
/// request and report back a single outcome.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub key: JobKey,
    /// Jobs that must succeed before this one may run.
    pub prerequisites: Vec<JobId>,
    /// Jobs waiting on this one, in plan order.
    pub dependents: Vec<JobId>,
    state: JobState,
    unresolved: usize,
    attempts: u32,
    outcome: Option<JobOutcome>,
}

impl Job {
    pub fn new(id: JobId, key: JobKey, prerequisites: Vec<JobId>) -> Self {
        let unresolved = prerequisites.len();
        Self {
            id,
            key,
            prerequisites,
            dependents: Vec::new(),
            state: JobState::Waiting,
            unresolved,
            attempts: 0,
            outcome: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Times the action has been dispatched.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// Whether every prerequisite has succeeded.
    pub fn is_unblocked(&self) -> bool {
        self.unresolved == 0
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: JobState) -> Result<JobState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvariantViolation(format!(
                "job {} cannot move from {} to {}",
                self.key, self.state, next
            )));
        }
        let old = self.state;
        self.state = next;
        Ok(old)
    }

    /// Record the job's final outcome and move to the matching terminal
    /// state. The outcome can only be set once.
    pub fn finish(&mut self, outcome: JobOutcome) -> Result<JobState> {
        if self.outcome.is_some() {
            return Err(Error::InvariantViolation(format!(
                "job {} already has a result",
                self.key
            )));
        }
        let old = self.transition(outcome.state())?;
        self.outcome = Some(outcome);
        Ok(old)
    }

    /// Start a new attempt, returning its number.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        self.transition(JobState::Running)?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Note that one prerequisite succeeded. Returns true when that was the
    /// last one outstanding.
    pub fn resolve_prerequisite(&mut self) -> bool {
        self.unresolved = self.unresolved.saturating_sub(1);
        self.unresolved == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::{ActionError, ActionKind, ActionOutput};

    fn job() -> Job {
        Job::new(
            JobId::new(1),
            JobKey::new("app", ActionKind::Build),
            vec![JobId::new(0)],
        )
    }

    #[test]
    fn test_new_job_is_waiting_and_blocked() {
        let job = job();
        assert_eq!(job.state(), JobState::Waiting);
        assert!(!job.is_unblocked());
        assert_eq!(job.attempts(), 0);
    }

    #[test]
    fn test_illegal_transition_is_invariant_violation() {
        let mut job = job();
        let err = job.transition(JobState::Running).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(job.state(), JobState::Waiting);
    }

    #[test]
    fn test_result_is_set_once() {
        let mut job = job();
        job.transition(JobState::Queued).unwrap();
        job.begin_attempt().unwrap();
        job.finish(JobOutcome::Success(ActionOutput::empty())).unwrap();

        let err = job
            .finish(JobOutcome::Failed(ActionError::fatal("late")))
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(job.state(), JobState::Success);
        assert!(matches!(job.outcome(), Some(JobOutcome::Success(_))));
    }

    #[test]
    fn test_retry_counts_attempts() {
        let mut job = job();
        job.transition(JobState::Queued).unwrap();
        assert_eq!(job.begin_attempt().unwrap(), 1);
        job.transition(JobState::Queued).unwrap();
        assert_eq!(job.begin_attempt().unwrap(), 2);
    }

    #[test]
    fn test_resolve_prerequisite() {
        let mut job = job();
        assert!(job.resolve_prerequisite());
        assert!(job.is_unblocked());
    }
}
