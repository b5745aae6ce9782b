//! Dispatch order among ready jobs of one queue.

use stratum_core::JobId;

use crate::graph::JobGraph;

/// Scores a ready job. Higher scores are dispatched first; equal scores
/// keep enqueue order.
pub trait Ranking: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, job: JobId, graph: &JobGraph) -> i64;
}

/// Plain enqueue order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fifo;

impl Ranking for Fifo {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn score(&self, _job: JobId, _graph: &JobGraph) -> i64 {
        0
    }
}

/// Prefer jobs that more work is waiting on.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnblockingFirst;

impl Ranking for UnblockingFirst {
    fn name(&self) -> &'static str {
        "unblocking-first"
    }

    fn score(&self, job: JobId, graph: &JobGraph) -> i64 {
        graph.transitive_dependents(job).len() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::{ActionKind, BuildPlan, JobKey};

    #[test]
    fn test_unblocking_first_counts_transitive_dependents() {
        let key = |e: &str| JobKey::new(e, ActionKind::Build);
        let mut plan = BuildPlan::new();
        plan.add_job(key("leaf"), vec![])
            .add_job(key("root"), vec![])
            .add_job(key("mid"), vec![key("root")])
            .add_job(key("top"), vec![key("mid")]);
        let graph = JobGraph::from_plan(&plan).unwrap();

        assert_eq!(UnblockingFirst.score(JobId::new(0), &graph), 0);
        assert_eq!(UnblockingFirst.score(JobId::new(1), &graph), 2);
        assert_eq!(Fifo.score(JobId::new(1), &graph), 0);
    }
}
