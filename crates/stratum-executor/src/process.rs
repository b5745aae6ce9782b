//! Subprocess execution with cancellation.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use stratum_core::{ActionContext, ActionError, MessageType};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use stratum_core::ElementRef;
use tokio::process::Command;
use tracing::{debug, warn};

/// Run `script` with `/bin/sh -c` in `cwd`.
///
/// The shell leads its own process group. Output lines are forwarded as
/// log messages. If the job is cancelled the whole group is killed and the
/// shell reaped before this returns.
pub async fn run_shell(
    script: &str,
    cwd: &Path,
    env: &[(String, String)],
    ctx: &ActionContext,
) -> Result<(), ActionError> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ActionError::fatal(format!("failed to spawn shell: {}", e)))?;

    let mut group = GroupGuard {
        pid: child.id(),
        element: &ctx.element,
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let status: Option<std::io::Result<ExitStatus>> = tokio::select! {
        (status, _, _) = async {
            tokio::join!(
                child.wait(),
                forward_lines(stdout, ctx),
                forward_lines(stderr, ctx),
            )
        } => Some(status),
        _ = ctx.cancelled() => None,
    };

    let Some(status) = status else {
        debug!(element = %ctx.element, pid = ?child.id(), "Killing cancelled command");
        group.kill();
        if let Err(e) = child.start_kill() {
            warn!(element = %ctx.element, error = %e, "Failed to kill command");
        }
        if let Err(e) = child.wait().await {
            warn!(element = %ctx.element, error = %e, "Failed to reap command");
        }
        return Err(ActionError::fatal("command interrupted"));
    };

    group.disarm();
    let status =
        status.map_err(|e| ActionError::fatal(format!("failed to wait for command: {}", e)))?;
    if status.success() {
        Ok(())
    } else {
        Err(
            ActionError::fatal(format!("command failed with {}", status))
                .with_detail(script.to_string()),
        )
    }
}

/// Kills the command's process group when dropped before the command
/// finished, as when an aborted job is torn down mid-await.
struct GroupGuard<'a> {
    pid: Option<u32>,
    element: &'a ElementRef,
}

impl GroupGuard<'_> {
    /// SIGKILL every process in the group.
    fn kill(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            warn!(element = %self.element, pid, error = %e, "Failed to kill command process group");
        }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn forward_lines<R>(reader: Option<R>, ctx: &ActionContext)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        ctx.message(MessageType::Log, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use stratum_core::{
        ActionKind, CancelReason, CancelScope, ElementRef, JobId, Message, MessageSink,
    };

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl MessageSink for Lines {
        fn message(&self, message: Message) {
            self.0.lock().unwrap().push(message.text);
        }
    }

    fn context(scope: CancelScope, sink: Arc<Lines>) -> ActionContext {
        ActionContext::new(
            JobId::new(0),
            ElementRef::new("base"),
            ActionKind::Build,
            1,
            scope,
            sink,
        )
    }

    #[tokio::test]
    async fn test_output_is_forwarded() {
        let sink = Arc::new(Lines::default());
        let ctx = context(CancelScope::new(), sink.clone());
        let env = vec![("GREETING".to_string(), "hello".to_string())];

        run_shell("echo $GREETING; echo oops >&2", &std::env::temp_dir(), &env, &ctx)
            .await
            .unwrap();

        let lines = sink.0.lock().unwrap();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"oops".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let ctx = context(CancelScope::new(), Arc::new(Lines::default()));
        let err = run_shell("exit 42", &std::env::temp_dir(), &[], &ctx)
            .await
            .unwrap_err();
        assert!(err.message.contains("42"));
        assert_eq!(err.detail.as_deref(), Some("exit 42"));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let scope = CancelScope::new();
        let ctx = context(scope.clone(), Arc::new(Lines::default()));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scope.cancel(CancelReason::UserInterrupt);
        });

        let started = Instant::now();
        let result = run_shell("sleep 30", &std::env::temp_dir(), &[], &ctx).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// Whether `pid` is a live process. Zombies count as gone.
    #[cfg(target_os = "linux")]
    fn alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_background_children() {
        let dir = std::env::temp_dir().join(format!("stratum-shell-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let pid_file = dir.join("sleep.pid");

        let scope = CancelScope::new();
        let ctx = context(scope.clone(), Arc::new(Lines::default()));
        let canceller = scope.clone();
        let watched = pid_file.clone();
        tokio::spawn(async move {
            while !watched.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel(CancelReason::UserInterrupt);
        });

        let result = run_shell("true; sleep 4242 & echo $! > sleep.pid; wait", &dir, &[], &ctx).await;
        assert!(result.is_err());

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive(pid), "sleep {} outlived the cancelled job", pid);

        std::fs::remove_dir_all(&dir).ok();
    }
}
