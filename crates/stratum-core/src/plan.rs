//! Build plans: the jobs a run must perform and what each waits for.
//!
//! The plan is the dependency contract between graph resolution and the
//! scheduler. It is assumed acyclic.

use serde::{Deserialize, Serialize};

use crate::action::ActionKind;
use crate::element::Element;
use crate::job::JobKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedJob {
    pub key: JobKey,
    /// Jobs that must succeed before this one may run.
    pub prerequisites: Vec<JobKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    jobs: Vec<PlannedJob>,
}

impl BuildPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the usual pipeline for `elements`, which must be given in
    /// dependency order.
    ///
    /// Each element gets one job per kind in `kinds`, each waiting on the
    /// element's previous kind. Builds also wait on the builds of the
    /// element's dependencies.
    pub fn standard(elements: &[Element], kinds: &[ActionKind]) -> Self {
        let mut plan = Self::new();
        let builds = kinds.contains(&ActionKind::Build);

        for element in elements {
            let mut previous: Option<ActionKind> = None;
            for kind in ActionKind::PIPELINE.into_iter().filter(|k| kinds.contains(k)) {
                let mut prerequisites = Vec::new();
                if let Some(prev) = previous {
                    prerequisites.push(JobKey::new(element.name.clone(), prev));
                }
                if kind == ActionKind::Build && builds {
                    prerequisites.extend(
                        element
                            .dependencies
                            .iter()
                            .map(|dep| JobKey::new(dep.clone(), ActionKind::Build)),
                    );
                }
                plan.add_job(JobKey::new(element.name.clone(), kind), prerequisites);
                previous = Some(kind);
            }
        }

        plan
    }

    pub fn add_job(&mut self, key: JobKey, prerequisites: Vec<JobKey>) -> &mut Self {
        self.jobs.push(PlannedJob { key, prerequisites });
        self
    }

    pub fn jobs(&self) -> &[PlannedJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Kinds used by this plan, in pipeline order.
    pub fn kinds(&self) -> Vec<ActionKind> {
        ActionKind::PIPELINE
            .into_iter()
            .filter(|k| self.jobs.iter().any(|j| j.key.action == *k))
            .collect()
    }
}
