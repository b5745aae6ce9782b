//! Per-kind job queues.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use stratum_core::{ActionKind, JobId, JobKey};

#[derive(Debug, Clone)]
struct Entry {
    job: JobId,
    key: JobKey,
    seq: u64,
}

/// Jobs of one action kind that have not yet been dispatched, plus
/// counters for the ones that have.
///
/// Waiting jobs still have unresolved prerequisites. Ready jobs are
/// dispatched highest score first, ties broken by enqueue order.
#[derive(Debug)]
pub struct Queue {
    kind: ActionKind,
    limit: usize,
    members: HashSet<JobKey>,
    waiting: HashMap<JobId, Entry>,
    ready: BTreeMap<(Reverse<i64>, u64), Entry>,
    next_seq: u64,
    running: usize,
    completed: usize,
    dispatched: usize,
}

impl Queue {
    pub fn new(kind: ActionKind, limit: usize) -> Self {
        Self {
            kind,
            limit,
            members: HashSet::new(),
            waiting: HashMap::new(),
            ready: BTreeMap::new(),
            next_seq: 0,
            running: 0,
            completed: 0,
            dispatched: 0,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Add a waiting job. Returns false if a job with the same key is
    /// already queued.
    pub fn enqueue(&mut self, job: JobId, key: &JobKey) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        let seq = self.take_seq();
        self.waiting.insert(
            job,
            Entry {
                job,
                key: key.clone(),
                seq,
            },
        );
        true
    }

    /// Move a waiting job to the ready set. Returns false if the job was
    /// not waiting here.
    pub fn mark_ready(&mut self, job: JobId, score: i64) -> bool {
        let Some(entry) = self.waiting.remove(&job) else {
            return false;
        };
        self.ready.insert((Reverse(score), entry.seq), entry);
        true
    }

    /// Put a job that was running back in the ready set for another
    /// attempt. It goes behind jobs already ready with the same score.
    pub fn requeue(&mut self, job: JobId, key: &JobKey, score: i64) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.running = self.running.saturating_sub(1);
        let seq = self.take_seq();
        self.ready.insert(
            (Reverse(score), seq),
            Entry {
                job,
                key: key.clone(),
                seq,
            },
        );
        true
    }

    /// Take the next job to dispatch, or `None` when nothing is ready or
    /// the queue is at its concurrency limit.
    pub fn pop_ready(&mut self) -> Option<JobId> {
        if self.is_saturated() {
            return None;
        }
        let (_, entry) = self.ready.pop_first()?;
        self.members.remove(&entry.key);
        self.running += 1;
        self.dispatched += 1;
        Some(entry.job)
    }

    /// Drop a job that will never be dispatched. Returns false if it was
    /// not queued here.
    pub fn remove(&mut self, job: JobId) -> bool {
        let entry = match self.waiting.remove(&job) {
            Some(entry) => Some(entry),
            None => {
                let pos = self
                    .ready
                    .iter()
                    .find(|(_, e)| e.job == job)
                    .map(|(pos, _)| *pos);
                pos.and_then(|pos| self.ready.remove(&pos))
            }
        };
        match entry {
            Some(entry) => {
                self.members.remove(&entry.key);
                true
            }
            None => false,
        }
    }

    /// Every job not yet dispatched, in enqueue order, leaving the queue
    /// with none.
    pub fn drain_pending(&mut self) -> Vec<JobId> {
        let mut entries: Vec<Entry> = self
            .waiting
            .drain()
            .map(|(_, e)| e)
            .chain(std::mem::take(&mut self.ready).into_values())
            .collect();
        entries.sort_by_key(|e| e.seq);
        self.members.clear();
        entries.into_iter().map(|e| e.job).collect()
    }

    /// A dispatched job reached a terminal state.
    pub fn job_finished(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.members.contains(key)
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.waiting.len() + self.ready.len()
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn is_saturated(&self) -> bool {
        self.running >= self.limit
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.running == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            kind: self.kind,
            limit: self.limit,
            dispatched: self.dispatched,
            completed: self.completed,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Per-queue figures reported in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub kind: ActionKind,
    pub limit: usize,
    /// Dispatches, counting retries.
    pub dispatched: usize,
    /// Dispatched jobs that reached a terminal state.
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(element: &str) -> JobKey {
        JobKey::new(element, ActionKind::Build)
    }

    fn queue_with(elements: &[&str], limit: usize) -> Queue {
        let mut queue = Queue::new(ActionKind::Build, limit);
        for (i, element) in elements.iter().enumerate() {
            assert!(queue.enqueue(JobId::new(i), &key(element)));
        }
        queue
    }

    #[test]
    fn test_duplicate_enqueue_rejected() {
        let mut queue = queue_with(&["a"], 4);
        assert!(!queue.enqueue(JobId::new(7), &key("a")));
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn test_waiting_jobs_are_not_dispatched() {
        let mut queue = queue_with(&["a"], 4);
        assert_eq!(queue.pop_ready(), None);
        queue.mark_ready(JobId::new(0), 0);
        assert_eq!(queue.pop_ready(), Some(JobId::new(0)));
    }

    #[test]
    fn test_equal_scores_keep_enqueue_order() {
        let mut queue = queue_with(&["a", "b", "c"], 4);
        // Readiness arrives out of order; enqueue order still decides.
        queue.mark_ready(JobId::new(2), 0);
        queue.mark_ready(JobId::new(0), 0);
        queue.mark_ready(JobId::new(1), 0);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_ready()).collect();
        assert_eq!(order, vec![JobId::new(0), JobId::new(1), JobId::new(2)]);
    }

    #[test]
    fn test_higher_score_first() {
        let mut queue = queue_with(&["a", "b"], 4);
        queue.mark_ready(JobId::new(0), 1);
        queue.mark_ready(JobId::new(1), 5);
        assert_eq!(queue.pop_ready(), Some(JobId::new(1)));
    }

    #[test]
    fn test_limit_saturates() {
        let mut queue = queue_with(&["a", "b"], 1);
        queue.mark_ready(JobId::new(0), 0);
        queue.mark_ready(JobId::new(1), 0);

        assert!(queue.pop_ready().is_some());
        assert_eq!(queue.pop_ready(), None);
        queue.job_finished();
        assert_eq!(queue.pop_ready(), Some(JobId::new(1)));
        assert_eq!(queue.stats().dispatched, 2);
    }

    #[test]
    fn test_remove_and_drain() {
        let mut queue = queue_with(&["a", "b", "c"], 4);
        queue.mark_ready(JobId::new(1), 0);

        assert!(queue.remove(JobId::new(1)));
        assert!(!queue.remove(JobId::new(1)));
        assert!(!queue.contains(&key("b")));

        assert_eq!(queue.drain_pending(), vec![JobId::new(0), JobId::new(2)]);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_requeue_after_dispatch() {
        let mut queue = queue_with(&["a"], 1);
        queue.mark_ready(JobId::new(0), 0);
        assert_eq!(queue.pop_ready(), Some(JobId::new(0)));
        assert!(queue.is_saturated());

        assert!(queue.requeue(JobId::new(0), &key("a"), 0));
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pop_ready(), Some(JobId::new(0)));
        assert_eq!(queue.stats().dispatched, 2);
    }
}
