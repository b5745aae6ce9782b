//! The run's job table and the links between jobs.

use std::collections::{BTreeSet, HashMap, VecDeque};
use stratum_core::{BuildPlan, Error, JobId, JobKey, Result};

use crate::job::Job;

/// All jobs of one run, indexed by id and by key.
#[derive(Debug, Default)]
pub struct JobGraph {
    jobs: Vec<Job>,
    index: HashMap<JobKey, JobId>,
}

impl JobGraph {
    /// Build the job table for `plan`.
    ///
    /// Jobs keep plan order. A duplicate key or a prerequisite that names
    /// no job in the plan is an `InvalidPlan` error.
    pub fn from_plan(plan: &BuildPlan) -> Result<Self> {
        let mut index = HashMap::with_capacity(plan.len());
        for (i, planned) in plan.jobs().iter().enumerate() {
            if index.insert(planned.key.clone(), JobId::new(i)).is_some() {
                return Err(Error::InvalidPlan(format!(
                    "job {} appears more than once",
                    planned.key
                )));
            }
        }

        let mut jobs = Vec::with_capacity(plan.len());
        for (i, planned) in plan.jobs().iter().enumerate() {
            let mut prerequisites = Vec::with_capacity(planned.prerequisites.len());
            for prereq in &planned.prerequisites {
                let id = index.get(prereq).copied().ok_or_else(|| {
                    Error::InvalidPlan(format!(
                        "job {} depends on {}, which is not in the plan",
                        planned.key, prereq
                    ))
                })?;
                if id.index() == i {
                    return Err(Error::InvalidPlan(format!(
                        "job {} depends on itself",
                        planned.key
                    )));
                }
                if !prerequisites.contains(&id) {
                    prerequisites.push(id);
                }
            }
            jobs.push(Job::new(JobId::new(i), planned.key.clone(), prerequisites));
        }

        for i in 0..jobs.len() {
            let prerequisites = jobs[i].prerequisites.clone();
            for prereq in prerequisites {
                jobs[prereq.index()].dependents.push(JobId::new(i));
            }
        }

        Ok(Self { jobs, index })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, id: JobId) -> Result<&Job> {
        self.jobs
            .get(id.index())
            .ok_or_else(|| Error::InvariantViolation(format!("unknown job id {}", id)))
    }

    pub fn get_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id.index())
            .ok_or_else(|| Error::InvariantViolation(format!("unknown job id {}", id)))
    }

    pub fn lookup(&self, key: &JobKey) -> Option<JobId> {
        self.index.get(key).copied()
    }

    /// Every job that directly or indirectly waits on `id`, in id order.
    pub fn transitive_dependents(&self, id: JobId) -> Vec<JobId> {
        let mut seen = BTreeSet::new();
        let mut pending: VecDeque<JobId> = VecDeque::new();
        if let Some(job) = self.jobs.get(id.index()) {
            pending.extend(job.dependents.iter().copied());
        }
        while let Some(next) = pending.pop_front() {
            if seen.insert(next) {
                if let Some(job) = self.jobs.get(next.index()) {
                    pending.extend(job.dependents.iter().copied());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Count of jobs not yet in a terminal state.
    pub fn unfinished(&self) -> usize {
        self.jobs.iter().filter(|j| !j.is_terminal()).count()
    }
}
