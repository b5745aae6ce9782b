//! Runs one job's action in its own execution context.

use futures::FutureExt;
use std::any::Any;
use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_core::{
    Action, ActionContext, ActionError, CancelReason, CancelScope, JobId, JobKey, JobOutcome,
};
use tracing::{debug, info, warn};

use crate::log::{JobLog, JobMessenger, MessageForwarder};
use crate::pool::WorkerSlot;

/// Everything needed to run one attempt of a job.
pub struct JobRequest {
    pub job: JobId,
    pub key: JobKey,
    /// 1 for the first dispatch.
    pub attempt: u32,
    pub action: Arc<dyn Action>,
    pub timeout: Option<Duration>,
}

/// The single message an execution sends back to the scheduler.
#[derive(Debug)]
pub struct ExecutionReport {
    pub job: JobId,
    pub key: JobKey,
    pub attempt: u32,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
    pub worker: usize,
    /// The action did not stop within the grace period and was torn down.
    pub forced: bool,
}

/// Runs job requests, converting every way an action can end into exactly
/// one [`JobOutcome`].
pub struct JobRunner {
    abort_grace: Duration,
    log_dir: Option<PathBuf>,
    forwarder: Option<Arc<dyn MessageForwarder>>,
}

impl JobRunner {
    pub fn new(abort_grace: Duration) -> Self {
        Self {
            abort_grace,
            log_dir: None,
            forwarder: None,
        }
    }

    /// Record each job's messages to a file under `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn MessageForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Run `request` to completion under `scope`.
    ///
    /// The worker slot is held until the action has stopped and the job's
    /// log is closed, and released before the report is returned.
    pub async fn execute(
        self: Arc<Self>,
        request: JobRequest,
        scope: CancelScope,
        slot: WorkerSlot,
    ) -> ExecutionReport {
        let started = Instant::now();
        let worker = slot.id();

        let log = self.log_dir.as_ref().and_then(|dir| {
            JobLog::create(dir, request.job, &request.key)
                .map_err(|e| warn!(job = %request.key, error = %e, "Failed to open job log"))
                .ok()
        });
        let messenger = Arc::new(JobMessenger::new(
            request.job,
            request.key.clone(),
            log,
            self.forwarder.clone(),
        ));
        let ctx = ActionContext::new(
            request.job,
            request.key.element.clone(),
            request.key.action,
            request.attempt,
            scope.clone(),
            messenger.clone(),
        );

        debug!(job = %request.key, worker, attempt = request.attempt, "Executing job");
        let (outcome, forced) = self.drive(&request, &ctx, &scope).await;

        if forced {
            if let Some(log) = messenger.log() {
                log.record_forced_termination();
            }
        }
        drop(ctx);
        drop(messenger);
        drop(slot);

        ExecutionReport {
            job: request.job,
            key: request.key,
            attempt: request.attempt,
            outcome,
            elapsed: started.elapsed(),
            worker,
            forced,
        }
    }

    async fn drive(
        &self,
        request: &JobRequest,
        ctx: &ActionContext,
        scope: &CancelScope,
    ) -> (JobOutcome, bool) {
        let action = request.action.clone();
        let cancellable = action.is_cancellable();
        let element = request.key.element.clone();

        let mut run = Box::pin(AssertUnwindSafe(action.execute(&element, ctx)).catch_unwind());
        let timer = async {
            match request.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => pending::<()>().await,
            }
        };

        let finished = tokio::select! {
            result = &mut run => Some(result),
            _ = scope.cancelled(), if cancellable => None,
            _ = timer, if cancellable => {
                info!(job = %request.key, timeout = ?request.timeout, "Job timed out");
                scope.cancel(CancelReason::Timeout);
                None
            }
        };

        let (result, forced) = match finished {
            Some(result) => (result, false),
            None => {
                debug!(job = %request.key, grace = ?self.abort_grace, "Waiting for aborted job to stop");
                let stopped = tokio::time::timeout(self.abort_grace, &mut run).await;
                match stopped {
                    Ok(result) => (result, false),
                    Err(_) => {
                        warn!(job = %request.key, "Job did not stop within grace period, tearing it down");
                        drop(run);
                        let reason = scope.reason().unwrap_or(CancelReason::Requested);
                        return (JobOutcome::Cancelled(reason), true);
                    }
                }
            }
        };

        let outcome = match result {
            Ok(Ok(output)) => JobOutcome::Success(output),
            // Only a cancellable action's error can be the result of the
            // abort; anything else failed on its own.
            Ok(Err(error)) => match scope.reason() {
                Some(reason) if cancellable => JobOutcome::Cancelled(reason),
                _ => JobOutcome::Failed(error),
            },
            Err(panic) => JobOutcome::Failed(ActionError::fatal(format!(
                "action panicked: {}",
                panic_message(&*panic)
            ))),
        };
        (outcome, forced)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use stratum_core::{ActionKind, ActionOutput, ActionResult, ElementRef, JobState};

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        /// Sleeps until cancelled, then reports an error.
        Cooperative,
        /// Ignores cancellation entirely.
        Stubborn,
    }

    struct TestAction {
        behaviour: Behaviour,
        cancellable: bool,
        finished: Arc<AtomicBool>,
    }

    impl TestAction {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                cancellable: true,
                finished: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Action for TestAction {
        fn kind(&self) -> ActionKind {
            ActionKind::Build
        }

        fn is_cancellable(&self) -> bool {
            self.cancellable
        }

        async fn execute(&self, _element: &ElementRef, ctx: &ActionContext) -> ActionResult {
            let result = match self.behaviour {
                Behaviour::Succeed => Ok(ActionOutput::empty().with_detail("done")),
                Behaviour::Fail => Err(ActionError::fatal("exit status 2")),
                Behaviour::Panic => panic!("boom"),
                Behaviour::Cooperative => {
                    ctx.cancelled().await;
                    Err(ActionError::fatal("interrupted"))
                }
                Behaviour::Stubborn => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ActionOutput::empty())
                }
            };
            self.finished.store(true, Ordering::SeqCst);
            result
        }
    }

    fn request(action: TestAction, timeout: Option<Duration>) -> JobRequest {
        JobRequest {
            job: JobId::new(0),
            key: JobKey::new("base", ActionKind::Build),
            attempt: 1,
            action: Arc::new(action),
            timeout,
        }
    }

    async fn run(action: TestAction, scope: CancelScope, timeout: Option<Duration>) -> ExecutionReport {
        let runner = Arc::new(JobRunner::new(Duration::from_millis(100)));
        let pool = WorkerPool::new(1);
        let slot = pool.try_acquire().unwrap();
        runner.execute(request(action, timeout), scope, slot).await
    }

    #[tokio::test]
    async fn test_success() {
        let report = run(TestAction::new(Behaviour::Succeed), CancelScope::new(), None).await;
        assert_eq!(report.outcome.state(), JobState::Success);
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn test_failure() {
        let report = run(TestAction::new(Behaviour::Fail), CancelScope::new(), None).await;
        match report.outcome {
            JobOutcome::Failed(e) => assert_eq!(e.message, "exit status 2"),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let report = run(TestAction::new(Behaviour::Panic), CancelScope::new(), None).await;
        match report.outcome {
            JobOutcome::Failed(e) => assert!(e.message.contains("boom")),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cooperative_abort_is_cancelled_not_failed() {
        let scope = CancelScope::new();
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel(CancelReason::UserInterrupt);
        });

        let report = run(TestAction::new(Behaviour::Cooperative), scope, None).await;
        assert!(matches!(
            report.outcome,
            JobOutcome::Cancelled(CancelReason::UserInterrupt)
        ));
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn test_stubborn_action_is_torn_down() {
        let scope = CancelScope::new();
        scope.cancel(CancelReason::Requested);

        let action = TestAction::new(Behaviour::Stubborn);
        let finished = action.finished.clone();
        let report = run(action, scope, None).await;

        assert!(matches!(report.outcome, JobOutcome::Cancelled(_)));
        assert!(report.forced);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_uses_abort_path() {
        let report = run(
            TestAction::new(Behaviour::Cooperative),
            CancelScope::new(),
            Some(Duration::from_millis(20)),
        )
        .await;
        assert!(matches!(
            report.outcome,
            JobOutcome::Cancelled(CancelReason::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_non_cancellable_action_runs_to_completion() {
        let scope = CancelScope::new();
        scope.cancel(CancelReason::Requested);

        let mut action = TestAction::new(Behaviour::Succeed);
        action.cancellable = false;
        let report = run(action, scope, None).await;
        assert_eq!(report.outcome.state(), JobState::Success);
    }

    #[tokio::test]
    async fn test_non_cancellable_failure_stays_failed() {
        let scope = CancelScope::new();
        scope.cancel(CancelReason::UserInterrupt);

        let mut action = TestAction::new(Behaviour::Fail);
        action.cancellable = false;
        let report = run(action, scope, None).await;
        match report.outcome {
            JobOutcome::Failed(e) => assert_eq!(e.message, "exit status 2"),
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn test_slot_released_after_execution() {
        let runner = Arc::new(JobRunner::new(Duration::from_millis(100)));
        let pool = WorkerPool::new(1);
        let slot = pool.try_acquire().unwrap();
        assert_eq!(pool.available(), 0);

        runner
            .execute(
                request(TestAction::new(Behaviour::Succeed), None),
                CancelScope::new(),
                slot,
            )
            .await;
        assert_eq!(pool.available(), 1);
    }
}
