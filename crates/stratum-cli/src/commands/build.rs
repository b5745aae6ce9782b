//! Local build command.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use stratum_cache::{ArtifactStore, LocalCache};
use stratum_config::{ErrorPolicy, SystemConfig};
use stratum_core::{ActionKind, BuildPlan, CancelReason, CancelScope, JobState};
use stratum_executor::{BuildAction, PullAction, PushAction, ShellAction, format_message};
use stratum_scheduler::{ActionRegistry, Scheduler, SchedulerEvent, UnblockingFirst};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{command_table, load_plan, pipeline_kinds, workspace_dir};

pub struct BuildOptions {
    pub targets: Vec<String>,
    pub track: bool,
    pub on_error: Option<ErrorPolicy>,
    pub max_jobs: Option<usize>,
    pub unblocking_first: bool,
    pub json: bool,
}

/// Build the requested elements, printing progress as it happens.
pub async fn run_build(
    plan_path: &Path,
    mut config: SystemConfig,
    options: BuildOptions,
) -> Result<stratum_scheduler::RunSummary> {
    if let Some(policy) = options.on_error {
        config.scheduler.on_error = policy;
    }
    if let Some(max_jobs) = options.max_jobs {
        config.scheduler.max_jobs = max_jobs;
    }

    let plan_file = load_plan(plan_path)?;
    let workspace = workspace_dir(plan_path)?;
    let elements = plan_file.resolve(&options.targets)?;
    let table = Arc::new(command_table(&plan_file, &elements)?);

    let cache = LocalCache::open("local", workspace.join(&config.cache.directory))
        .await
        .context("Failed to open artifact cache")?;
    let remote = match &config.cache.remote {
        Some(dir) => {
            let remote = LocalCache::open("remote", workspace.join(dir))
                .await
                .context("Failed to open remote artifact cache")?;
            Some(Arc::new(remote) as Arc<dyn ArtifactStore>)
        }
        None => None,
    };

    let work_dir = workspace.join(".stratum").join("work");
    let mut actions = ActionRegistry::new()
        .with(ShellAction::new(ActionKind::Track, table.clone(), &work_dir))
        .with(ShellAction::new(ActionKind::Fetch, table.clone(), &work_dir).skip_when_cached(cache.clone()))
        .with(BuildAction::new(table.clone(), &work_dir, cache.clone()));
    if let Some(remote) = &remote {
        actions.register(Arc::new(PullAction::new(table.clone(), cache.clone(), remote.clone())));
        actions.register(Arc::new(PushAction::new(table.clone(), cache.clone(), remote.clone())));
    }

    let plan = BuildPlan::standard(&elements, &pipeline_kinds(options.track, remote.is_some()));
    let log_dir = config
        .logging
        .directory
        .as_ref()
        .map(|dir| workspace.join(dir))
        .unwrap_or_else(|| workspace.join(".stratum").join("logs"));

    if !options.json {
        println!("Building {} elements ({} jobs)", elements.len(), plan.len());
        println!("Workspace: {}", workspace.display());
    }
    info!(
        elements = elements.len(),
        jobs = plan.len(),
        on_error = ?config.scheduler.on_error,
        "Starting build"
    );

    let mut scheduler = Scheduler::new(config.scheduler.clone()).with_log_dir(log_dir);
    if options.unblocking_first {
        scheduler = scheduler.with_ranking(UnblockingFirst);
    }
    let rx = scheduler.subscribe();
    let printer = tokio::spawn(print_events(rx, options.json));

    let scope = CancelScope::new();
    let interrupt = scope.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping running jobs");
            interrupt.cancel(CancelReason::UserInterrupt);
        }
    });

    let result = scheduler.run(&plan, &actions, scope).await;
    signal.abort();
    printer.await.context("Event printer task failed")?;

    Ok(result?)
}

async fn print_events(mut rx: mpsc::Receiver<SchedulerEvent>, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
            continue;
        }

        match event {
            SchedulerEvent::JobStateChanged(change) => {
                let marker = match change.new_state {
                    JobState::Waiting | JobState::Queued => continue,
                    JobState::Running => "▶",
                    JobState::Success => "✓",
                    JobState::Failed => "✗",
                    JobState::Skipped => "⊘",
                    JobState::Cancelled => "○",
                };
                match &change.detail {
                    Some(detail) => println!(
                        "{} {:<6} {} {} ({})",
                        marker,
                        change.action.as_str(),
                        change.element,
                        change.new_state,
                        detail
                    ),
                    None => println!(
                        "{} {:<6} {} {}",
                        marker,
                        change.action.as_str(),
                        change.element,
                        change.new_state
                    ),
                }
            }
            SchedulerEvent::JobMessage { message, .. } => {
                println!("  {}", format_message(&message));
            }
            SchedulerEvent::RunCompleted(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plan(dir: &Path, plan: &str) -> std::path::PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join("stratum.plan.kdl");
        std::fs::write(&path, plan).unwrap();
        path
    }

    fn options() -> BuildOptions {
        BuildOptions {
            targets: Vec::new(),
            track: false,
            on_error: None,
            max_jobs: Some(2),
            unblocking_first: false,
            json: true,
        }
    }

    #[tokio::test]
    async fn test_build_runs_and_caches() {
        let dir = std::env::temp_dir().join(format!("stratum-cli-{}", uuid::Uuid::new_v4()));
        let plan = write_plan(
            &dir,
            r#"
element "base" {
    build "echo base > $STRATUM_INSTALL_DIR/base.txt"
}
element "app" {
    depends "base"
    build "echo app > $STRATUM_INSTALL_DIR/app.txt"
}
"#,
        );

        let summary = run_build(&plan, SystemConfig::default(), options()).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.total, 4);

        // Second run finds both artifacts in the cache.
        let summary = run_build(&plan, SystemConfig::default(), options()).await.unwrap();
        assert!(summary.is_success());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_failed_build_skips_dependents() {
        let dir = std::env::temp_dir().join(format!("stratum-cli-{}", uuid::Uuid::new_v4()));
        let plan = write_plan(
            &dir,
            r#"
element "base" {
    build "exit 3"
}
element "app" {
    depends "base"
    build "true"
}
"#,
        );

        let summary = run_build(&plan, SystemConfig::default(), options()).await.unwrap();
        assert!(!summary.is_success());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failures[0].element.as_str(), "base");

        std::fs::remove_dir_all(&dir).ok();
    }
}
