//! The scheduling loop.
//!
//! One loop owns every job and queue of a run. Jobs execute in their own
//! tasks and report back exactly once; the loop applies each report,
//! releases dependents, and dispatches whatever became ready.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_config::{ErrorPolicy, SchedulerConfig};
use stratum_core::{
    Action, ActionKind, BuildPlan, CancelReason, CancelScope, Error, JobId, JobKey, JobOutcome,
    JobState, Result, RunId,
};
use stratum_executor::{
    ExecutionReport, JobRequest, JobRunner, MessageForwarder, WorkerPool, WorkerSlot,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::events::{EventSink, JobEvent, SchedulerEvent};
use crate::graph::JobGraph;
use crate::queue::Queue;
use crate::ranking::{Fifo, Ranking};
use crate::summary::{RunSummary, StopReason};

/// The action that runs each kind of job.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<ActionKind, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` for its kind, replacing any earlier one.
    pub fn register(&mut self, action: Arc<dyn Action>) -> &mut Self {
        self.actions.insert(action.kind(), action);
        self
    }

    pub fn with(mut self, action: impl Action + 'static) -> Self {
        self.register(Arc::new(action));
        self
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn Action>> {
        self.actions.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ActionKind> + '_ {
        self.actions.keys().copied()
    }
}

#[derive(Debug)]
enum Control {
    Abort(JobKey),
}

/// Lets other tasks intervene in a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl SchedulerHandle {
    /// Abort one job. A running job is interrupted; one that has not
    /// started is cancelled; one that already finished is left alone.
    ///
    /// Returns false when the run is over.
    pub fn abort_job(&self, key: JobKey) -> bool {
        self.tx.send(Control::Abort(key)).is_ok()
    }
}

/// Runs a build plan.
pub struct Scheduler {
    config: SchedulerConfig,
    ranking: Arc<dyn Ranking>,
    log_dir: Option<PathBuf>,
    events: Option<EventSink>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            ranking: Arc::new(Fifo),
            log_dir: None,
            events: None,
            control_tx,
            control_rx,
        }
    }

    pub fn with_ranking(mut self, ranking: impl Ranking + 'static) -> Self {
        self.ranking = Arc::new(ranking);
        self
    }

    /// Record each job's messages under `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Create an event channel sized from the configuration.
    pub fn subscribe(&mut self) -> mpsc::Receiver<SchedulerEvent> {
        let (sink, rx) = EventSink::channel(self.config.event_buffer);
        self.events = Some(sink);
        rx
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Run every job in `plan` to a terminal state.
    ///
    /// Cancelling `scope` cancels every job that has not started, aborts
    /// the running ones, and returns once all of them have stopped.
    ///
    /// Per-job failures are reported in the summary. An `Err` means the
    /// run could not start or the scheduler's own bookkeeping broke.
    pub async fn run(
        self,
        plan: &BuildPlan,
        actions: &ActionRegistry,
        scope: CancelScope,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let run_id = RunId::new();

        self.validate(plan, actions)?;
        let graph = JobGraph::from_plan(plan)?;

        let mut runner = JobRunner::new(self.config.abort_grace);
        if let Some(dir) = &self.log_dir {
            runner = runner.with_log_dir(dir.clone());
        }
        if let Some(events) = &self.events {
            let forwarder: Arc<dyn MessageForwarder> = Arc::new(events.clone());
            runner = runner.with_forwarder(forwarder);
        }

        info!(
            run_id = %run_id,
            jobs = graph.len(),
            max_jobs = self.config.max_jobs,
            ranking = self.ranking.name(),
            "Starting run"
        );

        let mut run = Run::new(
            run_id,
            &self.config,
            actions,
            Arc::new(runner),
            graph,
            &plan.kinds(),
            self.ranking.clone(),
            self.events.clone(),
            scope.child(),
        );

        let mut tasks = JoinSet::new();
        let mut control_rx = self.control_rx;
        let driven = match run.start() {
            Ok(()) => run.drive(&mut tasks, &mut control_rx).await,
            Err(e) => Err(e),
        };

        if let Err(e) = driven {
            error!(run_id = %run_id, error = %e, "Run aborted");
            run.scope.cancel(CancelReason::Requested);
            while tasks.join_next().await.is_some() {}
            return Err(e);
        }

        let summary = run.summarize(started.elapsed());
        info!(
            run_id = %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            stop_reason = %summary.stop_reason,
            "Run finished"
        );
        if let Some(events) = &self.events {
            events.emit(SchedulerEvent::RunCompleted(summary.clone()));
        }
        Ok(summary)
    }

    fn validate(&self, plan: &BuildPlan, actions: &ActionRegistry) -> Result<()> {
        if self.config.max_jobs == 0 {
            return Err(Error::ResourceExhaustion(
                "max-jobs is 0, so no job could ever run".to_string(),
            ));
        }
        for kind in plan.kinds() {
            if actions.get(kind).is_none() {
                return Err(Error::InvalidPlan(format!(
                    "plan has {} jobs but no {} action is registered",
                    kind, kind
                )));
            }
            if self.config.limit(kind) == 0 {
                return Err(Error::ResourceExhaustion(format!(
                    "the {} queue has a limit of 0 but the plan has {} jobs",
                    kind, kind
                )));
            }
        }
        Ok(())
    }
}

/// State of one run, owned by the scheduling loop.
struct Run<'a> {
    id: RunId,
    config: &'a SchedulerConfig,
    actions: &'a ActionRegistry,
    runner: Arc<JobRunner>,
    graph: JobGraph,
    queues: Vec<Queue>,
    pool: Arc<WorkerPool>,
    ranking: Arc<dyn Ranking>,
    events: Option<EventSink>,
    scope: CancelScope,
    /// Scopes of running jobs, for aborting them one at a time.
    job_scopes: HashMap<JobId, CancelScope>,
    cancel_handled: bool,
    quit: bool,
    fail_fast: bool,
}

impl<'a> Run<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: RunId,
        config: &'a SchedulerConfig,
        actions: &'a ActionRegistry,
        runner: Arc<JobRunner>,
        graph: JobGraph,
        kinds: &[ActionKind],
        ranking: Arc<dyn Ranking>,
        events: Option<EventSink>,
        scope: CancelScope,
    ) -> Self {
        Self {
            id,
            config,
            actions,
            runner,
            queues: kinds
                .iter()
                .map(|&kind| Queue::new(kind, config.limit(kind)))
                .collect(),
            graph,
            pool: WorkerPool::new(config.max_jobs),
            ranking,
            events,
            scope,
            job_scopes: HashMap::new(),
            cancel_handled: false,
            quit: false,
            fail_fast: false,
        }
    }

    /// Queue every job and release the ones with nothing to wait for.
    fn start(&mut self) -> Result<()> {
        let entries: Vec<(JobId, JobKey, bool)> = self
            .graph
            .jobs()
            .iter()
            .map(|job| (job.id, job.key.clone(), job.is_unblocked()))
            .collect();

        for (id, key, _) in &entries {
            if !self.queue_mut(key.action)?.enqueue(*id, key) {
                return Err(Error::InvariantViolation(format!(
                    "job {} queued twice",
                    key
                )));
            }
        }
        for (id, _, unblocked) in entries {
            if unblocked {
                self.make_ready(id)?;
            }
        }
        Ok(())
    }

    async fn drive(
        &mut self,
        tasks: &mut JoinSet<ExecutionReport>,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Result<()> {
        let scope = self.scope.clone();
        loop {
            self.handle_cancellation(tasks.len())?;
            self.dispatch(tasks)?;
            // The scope may have been cancelled after the check above, in
            // which case dispatch started nothing.
            self.handle_cancellation(tasks.len())?;

            if tasks.is_empty() {
                let unfinished = self.graph.unfinished();
                if unfinished == 0 {
                    return Ok(());
                }
                return Err(Error::InvariantViolation(format!(
                    "{} jobs are pending but none is ready or running",
                    unfinished
                )));
            }

            tokio::select! {
                biased;
                _ = scope.cancelled(), if !self.cancel_handled => {}
                Some(control) = control.recv() => self.handle_control(control)?,
                Some(joined) = tasks.join_next() => match joined {
                    Ok(report) => self.apply_report(report)?,
                    Err(e) => {
                        return Err(Error::InvariantViolation(format!(
                            "job task ended without a report: {}",
                            e
                        )));
                    }
                },
            }
        }
    }

    /// Cancel every pending job the first time the run scope is seen
    /// cancelled.
    fn handle_cancellation(&mut self, running: usize) -> Result<()> {
        if self.cancel_handled || !self.scope.is_cancelled() {
            return Ok(());
        }
        let reason = self.scope.reason().unwrap_or(CancelReason::Requested);
        warn!(run_id = %self.id, reason = %reason, running, "Run cancelled, waiting for running jobs to stop");
        self.cancel_handled = true;
        self.cancel_pending(reason)
    }

    /// Whether new work may no longer start.
    fn stopped(&self) -> bool {
        self.quit || self.scope.is_cancelled()
    }

    /// Start ready jobs, queue by queue in pipeline order, while both the
    /// queue and the worker pool have room.
    fn dispatch(&mut self, tasks: &mut JoinSet<ExecutionReport>) -> Result<usize> {
        if self.stopped() {
            return Ok(0);
        }
        let mut started = 0;
        for qi in 0..self.queues.len() {
            loop {
                if self.pool.available() == 0 {
                    return Ok(started);
                }
                let Some(id) = self.queues[qi].pop_ready() else {
                    break;
                };
                let Some(slot) = self.pool.try_acquire() else {
                    return Err(Error::InvariantViolation(
                        "worker pool ran dry during dispatch".to_string(),
                    ));
                };
                self.start_job(id, slot, tasks)?;
                started += 1;
            }
        }
        Ok(started)
    }

    fn start_job(
        &mut self,
        id: JobId,
        slot: WorkerSlot,
        tasks: &mut JoinSet<ExecutionReport>,
    ) -> Result<()> {
        let key = self.graph.get(id)?.key.clone();
        let action = self.actions.get(key.action).ok_or_else(|| {
            Error::InvalidPlan(format!("no action registered for {}", key.action))
        })?;

        let attempt = self.graph.get_mut(id)?.begin_attempt()?;
        let detail = (attempt > 1).then(|| format!("attempt {}", attempt));
        self.record(id, JobState::Queued, JobState::Running, detail);

        let job_scope = self.scope.child();
        self.job_scopes.insert(id, job_scope.clone());

        info!(job = %key, worker = slot.id(), attempt, "Dispatching job");
        let request = JobRequest {
            job: id,
            timeout: self.config.timeout(key.action),
            key,
            attempt,
            action,
        };
        tasks.spawn(self.runner.clone().execute(request, job_scope, slot));
        Ok(())
    }

    fn apply_report(&mut self, report: ExecutionReport) -> Result<()> {
        self.job_scopes.remove(&report.job);
        let id = report.job;
        let kind = report.key.action;
        if report.forced {
            warn!(job = %report.key, worker = report.worker, "Job was forcefully terminated");
        }

        match report.outcome {
            JobOutcome::Failed(error)
                if error.is_retryable()
                    && report.attempt < self.config.max_attempts(kind)
                    && !self.stopped() =>
            {
                warn!(job = %report.key, attempt = report.attempt, error = %error, "Retrying job");
                self.set_state(id, JobState::Queued, Some(format!("retrying after: {}", error)))?;
                let score = self.ranking.score(id, &self.graph);
                if !self.queue_mut(kind)?.requeue(id, &report.key, score) {
                    return Err(Error::InvariantViolation(format!(
                        "job {} already queued on retry",
                        report.key
                    )));
                }
                Ok(())
            }
            outcome => self.complete(id, outcome, report.elapsed),
        }
    }

    /// Record a dispatched job's final outcome and re-evaluate its
    /// dependents.
    fn complete(&mut self, id: JobId, outcome: JobOutcome, elapsed: Duration) -> Result<()> {
        let key = self.graph.get(id)?.key.clone();
        let state = outcome.state();
        let detail = outcome.describe();
        let triggers_policy = matches!(
            outcome,
            JobOutcome::Failed(_) | JobOutcome::Cancelled(CancelReason::Timeout)
        );

        let old = self.graph.get_mut(id)?.finish(outcome)?;
        self.queue_mut(key.action)?.job_finished();
        self.record(id, old, state, detail.clone());

        match state {
            JobState::Success => info!(job = %key, elapsed = ?elapsed, "Job succeeded"),
            JobState::Failed => {
                warn!(job = %key, elapsed = ?elapsed, error = detail.as_deref().unwrap_or(""), "Job failed")
            }
            _ => info!(job = %key, state = %state, "Job stopped"),
        }

        self.on_job_complete(id, state)?;
        if triggers_policy {
            self.apply_error_policy(&key)?;
        }
        Ok(())
    }

    /// Release or skip the dependents of a job that reached `state`.
    fn on_job_complete(&mut self, id: JobId, state: JobState) -> Result<()> {
        if state == JobState::Success {
            let dependents = self.graph.get(id)?.dependents.clone();
            for dep in dependents {
                let job = self.graph.get_mut(dep)?;
                if job.resolve_prerequisite() && job.state() == JobState::Waiting {
                    self.make_ready(dep)?;
                }
            }
        } else if state.is_failure() {
            let cause = self.graph.get(id)?.key.clone();
            for dep in self.graph.transitive_dependents(id) {
                let job = self.graph.get(dep)?;
                if job.is_terminal() {
                    continue;
                }
                let dep_key = job.key.clone();
                self.queue_mut(dep_key.action)?.remove(dep);
                let outcome = JobOutcome::Skipped {
                    cause: cause.clone(),
                };
                let detail = outcome.describe();
                let old = self.graph.get_mut(dep)?.finish(outcome)?;
                self.record(dep, old, JobState::Skipped, detail);
                info!(job = %dep_key, cause = %cause, "Skipping job");
            }
        }
        Ok(())
    }

    fn apply_error_policy(&mut self, failed: &JobKey) -> Result<()> {
        match self.config.on_error {
            ErrorPolicy::Continue => {}
            ErrorPolicy::Quit => {
                if !self.quit {
                    warn!(job = %failed, "Stopping after failure, letting running jobs finish");
                    self.quit = true;
                    self.cancel_pending(CancelReason::Requested)?;
                }
            }
            ErrorPolicy::Terminate => {
                if self.scope.cancel(CancelReason::FailFast) {
                    warn!(job = %failed, "Terminating run after failure");
                    self.fail_fast = true;
                }
            }
        }
        Ok(())
    }

    fn handle_control(&mut self, control: Control) -> Result<()> {
        match control {
            Control::Abort(key) => {
                let Some(id) = self.graph.lookup(&key) else {
                    warn!(job = %key, "Ignoring abort for unknown job");
                    return Ok(());
                };
                self.abort(id).map(|_| ())
            }
        }
    }

    /// Abort one job. Returns false if it had already finished.
    fn abort(&mut self, id: JobId) -> Result<bool> {
        let job = self.graph.get(id)?;
        let key = job.key.clone();
        match job.state() {
            state if state.is_terminal() => {
                debug!(job = %key, state = %state, "Job already finished, ignoring abort");
                Ok(false)
            }
            JobState::Running => {
                if let Some(scope) = self.job_scopes.get(&id) {
                    info!(job = %key, "Aborting job");
                    scope.cancel(CancelReason::Requested);
                }
                Ok(true)
            }
            _ => {
                info!(job = %key, "Cancelling job before it started");
                self.queue_mut(key.action)?.remove(id);
                let reason = CancelReason::Requested;
                let old = self.graph.get_mut(id)?.finish(JobOutcome::Cancelled(reason))?;
                self.record(id, old, JobState::Cancelled, Some(reason.to_string()));
                self.on_job_complete(id, JobState::Cancelled)?;
                Ok(true)
            }
        }
    }

    /// Cancel every job that has not been dispatched.
    fn cancel_pending(&mut self, reason: CancelReason) -> Result<()> {
        for qi in 0..self.queues.len() {
            for id in self.queues[qi].drain_pending() {
                let job = self.graph.get_mut(id)?;
                if job.is_terminal() {
                    continue;
                }
                let old = job.finish(JobOutcome::Cancelled(reason))?;
                self.record(id, old, JobState::Cancelled, Some(reason.to_string()));
            }
        }
        Ok(())
    }

    fn make_ready(&mut self, id: JobId) -> Result<()> {
        self.set_state(id, JobState::Queued, None)?;
        let score = self.ranking.score(id, &self.graph);
        let kind = self.graph.get(id)?.key.action;
        if !self.queue_mut(kind)?.mark_ready(id, score) {
            return Err(Error::InvariantViolation(format!(
                "job {} became ready but was not waiting in its queue",
                id
            )));
        }
        Ok(())
    }

    fn set_state(&mut self, id: JobId, next: JobState, detail: Option<String>) -> Result<()> {
        let old = self.graph.get_mut(id)?.transition(next)?;
        self.record(id, old, next, detail);
        Ok(())
    }

    /// Log and publish a state transition.
    fn record(&self, id: JobId, old: JobState, new: JobState, detail: Option<String>) {
        let Ok(job) = self.graph.get(id) else {
            return;
        };
        debug!(job = %job.key, from = %old, to = %new, "Job state changed");
        if let Some(events) = &self.events {
            events.emit(SchedulerEvent::JobStateChanged(JobEvent {
                job_id: id,
                element: job.key.element.clone(),
                action: job.key.action,
                old_state: old,
                new_state: new,
                timestamp: Utc::now(),
                detail,
            }));
        }
    }

    fn queue_mut(&mut self, kind: ActionKind) -> Result<&mut Queue> {
        self.queues
            .iter_mut()
            .find(|q| q.kind() == kind)
            .ok_or_else(|| Error::InvariantViolation(format!("no queue for {} jobs", kind)))
    }

    fn summarize(&self, elapsed: Duration) -> RunSummary {
        let stop_reason = if self.fail_fast {
            StopReason::Failure {
                policy: ErrorPolicy::Terminate,
            }
        } else if let Some(reason) = self.scope.reason() {
            StopReason::Cancelled { reason }
        } else if self.quit {
            StopReason::Failure {
                policy: ErrorPolicy::Quit,
            }
        } else {
            StopReason::Completed
        };

        let dropped = self.events.as_ref().map(EventSink::dropped).unwrap_or(0);
        RunSummary::collect(self.id, &self.graph, &self.queues, stop_reason, elapsed, dropped)
    }
}
