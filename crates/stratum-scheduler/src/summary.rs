//! The result of a run as reported to the caller.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use stratum_config::ErrorPolicy;
use stratum_core::{ActionKind, CancelReason, ElementRef, JobOutcome, JobState, RunId};

use crate::graph::JobGraph;
use crate::queue::{Queue, QueueStats};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// Every job reached a terminal state on its own.
    Completed,
    /// A job failed and the error policy stopped the run.
    Failure { policy: ErrorPolicy },
    /// The run was cancelled from outside.
    Cancelled { reason: CancelReason },
}

/// One failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub action: ActionKind,
    pub element: ElementRef,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Dispatches across all queues, counting retries.
    pub dispatched: usize,
    pub queues: Vec<QueueStats>,
    pub failures: Vec<FailureDetail>,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
    /// Events the observer missed because its channel was full.
    pub events_dropped: u64,
}

impl RunSummary {
    /// Tally the final state of every job.
    pub(crate) fn collect(
        run_id: RunId,
        graph: &JobGraph,
        queues: &[Queue],
        stop_reason: StopReason,
        elapsed: Duration,
        events_dropped: u64,
    ) -> Self {
        let mut stats: Vec<QueueStats> = queues.iter().map(Queue::stats).collect();
        let mut summary = Self {
            run_id,
            total: graph.len(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            dispatched: stats.iter().map(|s| s.dispatched).sum(),
            queues: Vec::new(),
            failures: Vec::new(),
            stop_reason,
            elapsed,
            events_dropped,
        };

        for job in graph.jobs() {
            let queue = stats.iter_mut().find(|s| s.kind == job.key.action);
            match job.state() {
                JobState::Success => {
                    summary.succeeded += 1;
                    if let Some(q) = queue {
                        q.succeeded += 1;
                    }
                }
                JobState::Failed => {
                    summary.failed += 1;
                    if let Some(q) = queue {
                        q.failed += 1;
                    }
                    if let Some(JobOutcome::Failed(error)) = job.outcome() {
                        summary.failures.push(FailureDetail {
                            action: job.key.action,
                            element: job.key.element.clone(),
                            message: error.message.clone(),
                            detail: error.detail.clone(),
                        });
                    }
                }
                JobState::Skipped => {
                    summary.skipped += 1;
                    if let Some(q) = queue {
                        q.skipped += 1;
                    }
                }
                JobState::Cancelled => {
                    summary.cancelled += 1;
                    if let Some(q) = queue {
                        q.cancelled += 1;
                    }
                }
                JobState::Waiting | JobState::Queued | JobState::Running => {}
            }
        }

        summary.queues = stats;
        summary
    }

    /// True when every job succeeded.
    pub fn is_success(&self) -> bool {
        self.succeeded == self.total && self.stop_reason == StopReason::Completed
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => f.write_str("completed"),
            StopReason::Failure { policy } => {
                write!(f, "stopped after a failure (on-error {})", policy_name(*policy))
            }
            StopReason::Cancelled { reason } => write!(f, "cancelled: {}", reason),
        }
    }
}

fn policy_name(policy: ErrorPolicy) -> &'static str {
    match policy {
        ErrorPolicy::Continue => "continue",
        ErrorPolicy::Quit => "quit",
        ErrorPolicy::Terminate => "terminate",
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} {} in {:.1}s", self.run_id, self.stop_reason, self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "  total: {}  succeeded: {}  failed: {}  skipped: {}  cancelled: {}  dispatched: {}",
            self.total, self.succeeded, self.failed, self.skipped, self.cancelled, self.dispatched
        )?;
        for queue in self.queues.iter().filter(|q| q.dispatched > 0 || q.skipped > 0 || q.cancelled > 0) {
            writeln!(
                f,
                "  {:<6} processed {}, failed {}, skipped {}, cancelled {}",
                queue.kind.as_str(),
                queue.succeeded,
                queue.failed,
                queue.skipped,
                queue.cancelled
            )?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "Failures:")?;
            for failure in &self.failures {
                writeln!(f, "  {} {}: {}", failure.action, failure.element, failure.message)?;
                if let Some(detail) = &failure.detail {
                    for line in detail.lines() {
                        writeln!(f, "      {}", line)?;
                    }
                }
            }
        }
        if self.events_dropped > 0 {
            writeln!(f, "  ({} events dropped)", self.events_dropped)?;
        }
        Ok(())
    }
}
