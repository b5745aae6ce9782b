//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use stratum_core::ActionKind;

/// What the scheduler does when a job fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Skip the failed job's dependents; independent work continues.
    #[default]
    Continue,
    /// Stop starting new jobs; let running jobs finish.
    Quit,
    /// Cancel the whole run, aborting running jobs.
    Terminate,
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(ErrorPolicy::Continue),
            "quit" => Ok(ErrorPolicy::Quit),
            "terminate" => Ok(ErrorPolicy::Terminate),
            other => Err(format!(
                "unknown error policy '{}', expected continue, quit or terminate",
                other
            )),
        }
    }
}

pub const DEFAULT_MAX_JOBS: usize = 8;
pub const DEFAULT_FETCHERS: usize = 10;
pub const DEFAULT_BUILDERS: usize = 4;
pub const DEFAULT_NETWORK_JOBS: usize = 4;
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on running jobs across all queues.
    pub max_jobs: usize,
    /// Upper bound on running jobs per action kind.
    pub limits: BTreeMap<ActionKind, usize>,
    pub on_error: ErrorPolicy,
    /// Extra attempts allowed after a retryable failure, per kind.
    pub retries: BTreeMap<ActionKind, u32>,
    /// Per-job time limit, per kind.
    pub timeouts: BTreeMap<ActionKind, Duration>,
    /// How long an aborted action may take to stop on its own before it is
    /// torn down.
    pub abort_grace: Duration,
    /// Capacity of the event channel; events beyond it are dropped.
    pub event_buffer: usize,
}

impl SchedulerConfig {
    pub fn limit(&self, kind: ActionKind) -> usize {
        self.limits.get(&kind).copied().unwrap_or(self.max_jobs)
    }

    /// Total attempts allowed for a job of `kind`.
    pub fn max_attempts(&self, kind: ActionKind) -> u32 {
        1 + self.retries.get(&kind).copied().unwrap_or(0)
    }

    pub fn timeout(&self, kind: ActionKind) -> Option<Duration> {
        self.timeouts.get(&kind).copied()
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_limit(mut self, kind: ActionKind, limit: usize) -> Self {
        self.limits.insert(kind, limit);
        self
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_retries(mut self, kind: ActionKind, retries: u32) -> Self {
        self.retries.insert(kind, retries);
        self
    }

    pub fn with_timeout(mut self, kind: ActionKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let limits = BTreeMap::from([
            (ActionKind::Track, DEFAULT_NETWORK_JOBS),
            (ActionKind::Pull, DEFAULT_NETWORK_JOBS),
            (ActionKind::Fetch, DEFAULT_FETCHERS),
            (ActionKind::Build, DEFAULT_BUILDERS),
            (ActionKind::Push, DEFAULT_NETWORK_JOBS),
        ]);
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            limits,
            on_error: ErrorPolicy::default(),
            retries: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            abort_grace: DEFAULT_ABORT_GRACE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}
