//! Child-process execution of task commands.
//!
//! One fire = one `sh -c <command>` child in its own process group.
//! Combined stdout+stderr is captured up to a configurable cap; kill
//! events and timeouts share a single cancellation path (SIGTERM to the
//! group, a grace window, then SIGKILL). The full run pipeline is:
//! mark `is_running` → execute → report the result (with bounded retry) →
//! clear `is_running` → release the distributed lock.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use cronmesh_core::clock::Clock;
use cronmesh_core::coordinator::Coordinator;
use cronmesh_core::keyspace::{self, KeySpace};
use cronmesh_core::model::{TaskInfo, TaskRunResult};
use cronmesh_core::report::{ReportError, ResultReport};
use cronmesh_core::retry::{RetryConfig, retry_with_policy};
use cronmesh_core::warner::{Warner, WarningData};

use cronmesh_coordinator::TaskLock;

/// Marker appended when captured output exceeds the cap.
const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Everything a run needs, shared across all executions of one agent.
pub struct ExecutionContext {
    pub coordinator: Arc<dyn Coordinator>,
    pub keyspace: KeySpace,
    pub reporter: Arc<dyn ResultReport>,
    pub warner: Arc<dyn Warner>,
    pub clock: Arc<dyn Clock>,
    pub agent_ip: String,
    /// SIGTERM → SIGKILL escalation window.
    pub grace: Duration,
    /// Cap on captured child output per run.
    pub output_cap: usize,
    pub report_retry: RetryConfig,
}

/// How a run ended.
#[derive(Debug)]
enum Ending {
    Exited(std::process::ExitStatus),
    Killed,
    TimedOut,
    Failed(String),
}

/// Execute one fire end to end. The caller has already acquired `lock`;
/// this function owns it and releases it on every path.
pub async fn run_task(
    ctx: Arc<ExecutionContext>,
    task: TaskInfo,
    mut lock: TaskLock,
    cancel: CancellationToken,
) {
    let start = ctx.clock.now_utc();
    set_running(&ctx, &task, true).await;

    let (output, error) = execute_command(&ctx, &task, &cancel).await;
    let end = ctx.clock.now_utc();

    let result = TaskRunResult {
        project_id: task.project_id,
        task_id: task.task_id.clone(),
        start_time: start,
        end_time: end,
        output,
        error,
        client_ip: ctx.agent_ip.clone(),
    };
    tracing::info!(
        task = %task.key(),
        with_error = result.with_error(),
        duration_ms = (end - start).num_milliseconds(),
        "task run finished"
    );

    let reported = retry_with_policy(&ctx.report_retry, ReportError::is_retryable, || {
        ctx.reporter.report(&result)
    })
    .await;
    if let Err(e) = reported {
        ctx.warner.warning(WarningData::task(
            format!("result report for task {} failed: {e}", task.key()),
            ctx.agent_ip.clone(),
        ));
    }

    set_running(&ctx, &task, false).await;
    lock.release().await;
}

/// Spawn and supervise the child, returning captured output and the error
/// string for the log (`None` on a clean zero exit).
async fn execute_command(
    ctx: &ExecutionContext,
    task: &TaskInfo,
    cancel: &CancellationToken,
) -> (String, Option<String>) {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&task.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group so signals reach the whole command tree.
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return (String::new(), Some(format!("spawn failed: {e}"))),
    };

    let buffer = Arc::new(tokio::sync::Mutex::new(CappedBuffer::new(ctx.output_cap)));
    let stdout_pump = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, buffer.clone())));
    let stderr_pump = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, buffer.clone())));

    let deadline = (task.timeout_seconds > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(task.timeout_seconds));

    let ending = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Ending::Exited(status),
            Err(e) => Ending::Failed(format!("wait failed: {e}")),
        },
        _ = cancel.cancelled() => Ending::Killed,
        _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)),
            if deadline.is_some() => Ending::TimedOut,
    };

    if matches!(ending, Ending::Killed | Ending::TimedOut) {
        terminate(&mut child, ctx.grace).await;
    }

    // Drain whatever the child managed to write.
    if let Some(pump) = stdout_pump {
        let _ = pump.await;
    }
    if let Some(pump) = stderr_pump {
        let _ = pump.await;
    }
    let output = {
        let mut buffer = buffer.lock().await;
        std::mem::take(&mut *buffer).into_string()
    };

    let error = match ending {
        Ending::Exited(status) if status.success() => None,
        Ending::Exited(status) => Some(match status.code() {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }),
        Ending::Killed => Some("killed".to_string()),
        Ending::TimedOut => Some("timeout".to_string()),
        Ending::Failed(detail) => Some(detail),
    };
    (output, error)
}

/// SIGTERM the process group, wait out the grace window, SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    signal_group(pid, Signal::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            signal_group(pid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

fn signal_group(pid: u32, signal: Signal) {
    // Negative pid addresses the process group created at spawn.
    let _ = nix::sys::signal::kill(Pid::from_raw(-(pid as i32)), signal);
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Best-effort rewrite of the task's `is_running` flag. Telemetry only;
/// the lock is the authoritative running-state signal, so every failure
/// path here is ignored.
async fn set_running(ctx: &ExecutionContext, task: &TaskInfo, running: bool) {
    let key = ctx.keyspace.task(&task.key());
    let Ok(Some(kv)) = ctx.coordinator.get(&key).await else {
        return;
    };
    let Ok(mut stored) = keyspace::decode_task(&key, &kv.value) else {
        return;
    };
    if stored.is_running == running {
        return;
    }
    stored.is_running = running;
    if let Err(e) = ctx
        .coordinator
        .put(&key, keyspace::encode(&stored), None)
        .await
    {
        tracing::debug!(task = %task.key(), error = %e, "is_running update failed");
    }
}

/// Size-capped output accumulator shared by the stdout and stderr pumps.
#[derive(Default)]
struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        let remaining = self.cap.saturating_sub(self.data.len());
        if chunk.len() <= remaining {
            self.data.extend_from_slice(chunk);
        } else {
            self.data.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        }
    }

    fn into_string(self) -> String {
        let mut s = String::from_utf8_lossy(&self.data).to_string();
        if self.truncated {
            s.push_str(TRUNCATION_MARKER);
        }
        s
    }
}

async fn pump(mut reader: impl AsyncReadExt + Unpin, buffer: Arc<tokio::sync::Mutex<CappedBuffer>>) {
    let mut chunk = [0u8; 8 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            // Keep draining even past the cap so the child never blocks on
            // a full pipe.
            Ok(n) if n > 0 => buffer.lock().await.extend(&chunk[..n]),
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronmesh_core::clock::SystemClock;
    use cronmesh_core::warner::LogWarner;
    use cronmesh_coordinator::MemoryCoordinator;

    fn task(command: &str, timeout_seconds: u64) -> TaskInfo {
        TaskInfo {
            project_id: 1,
            task_id: "t".into(),
            name: "test".into(),
            command: command.into(),
            cron_expr: "* * * * * *".into(),
            timeout_seconds,
            noseize: false,
            is_running: false,
        }
    }

    fn test_ctx() -> ExecutionContext {
        ExecutionContext {
            coordinator: MemoryCoordinator::new(),
            keyspace: KeySpace::new("/t"),
            reporter: Arc::new(NullReporter),
            warner: Arc::new(LogWarner),
            clock: Arc::new(SystemClock),
            agent_ip: "127.0.0.1".into(),
            grace: Duration::from_millis(500),
            output_cap: 1024 * 1024,
            report_retry: RetryConfig::default(),
        }
    }

    struct NullReporter;

    #[async_trait::async_trait]
    impl ResultReport for NullReporter {
        async fn report(&self, _result: &TaskRunResult) -> Result<(), ReportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let ctx = test_ctx();
        let (output, error) =
            execute_command(&ctx, &task("echo out; echo err >&2", 10), &CancellationToken::new())
                .await;
        assert!(output.contains("out"));
        assert!(output.contains("err"));
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_recorded() {
        let ctx = test_ctx();
        let (_, error) = execute_command(&ctx, &task("exit 3", 10), &CancellationToken::new()).await;
        assert_eq!(error.as_deref(), Some("exit status 3"));
    }

    #[tokio::test]
    async fn output_is_truncated_at_the_cap() {
        let mut ctx = test_ctx();
        ctx.output_cap = 64;
        let (output, error) = execute_command(
            &ctx,
            &task("head -c 100000 /dev/zero | tr '\\0' 'x'", 10),
            &CancellationToken::new(),
        )
        .await;
        assert!(error.is_none());
        assert!(output.ends_with(TRUNCATION_MARKER));
        assert!(output.len() <= 64 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let ctx = test_ctx();
        let started = std::time::Instant::now();
        let (_, error) = execute_command(&ctx, &task("sleep 30", 1), &CancellationToken::new()).await;
        assert_eq!(error.as_deref(), Some("timeout"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let ctx = test_ctx();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let (_, error) = execute_command(&ctx, &task("sleep 30", 0), &cancel).await;
        assert_eq!(error.as_deref(), Some("killed"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sigterm_is_tried_before_sigkill() {
        let ctx = test_ctx();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });
        // The child exits 0 on SIGTERM via its trap handler.
        let (output, error) = execute_command(
            &ctx,
            &task("trap 'echo termed; exit 0' TERM; sleep 30 & wait", 0),
            &cancel,
        )
        .await;
        assert_eq!(error.as_deref(), Some("killed"));
        assert!(output.contains("termed"));
    }

    #[tokio::test]
    async fn capped_buffer_marks_truncation_once() {
        let mut buffer = CappedBuffer::new(4);
        buffer.extend(b"abc");
        buffer.extend(b"defg");
        assert_eq!(buffer.data, b"abcd");
        assert!(buffer.truncated);
        let s = buffer.into_string();
        assert_eq!(s, format!("abcd{TRUNCATION_MARKER}"));
    }
}
