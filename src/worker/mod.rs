//! Worker -- executes exactly one test unit in its own OS process.
//!
//! Process isolation is deliberate: a crashing or runaway test must not take
//! the scheduler or other workers down with it. All child output is captured
//! into memory; nothing reaches the parent's console.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::{ExitOutcome, ProcessInfo, ProcessState, TestUnit};
use crate::monitor::ResourceMonitor;

/// How long a worker waits for its resource monitor to wind down.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(100);

/// How long a cancelled worker waits for OS-level process teardown.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// The opaque test-execution engine: given a unit, produce the command that
/// runs it. Wall-clock time and exit status are entirely the engine's.
pub trait TestExecutor: Send + Sync + 'static {
    fn command(&self, unit: &TestUnit) -> Command;
}

/// Runs a configured program with the unit appended as the final argument.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl TestExecutor for CommandExecutor {
    fn command(&self, unit: &TestUnit) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(unit);
        cmd
    }
}

/// Live handle to a started worker, held by the scheduler until the unit
/// reaches a terminal state. Dropping the handle does not kill the child;
/// cancellation is explicit.
pub struct WorkerHandle {
    pub name: TestUnit,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to kill its child process and wind down.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once the supervising task has exited (normally or not).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait up to `timeout` for the supervising task to exit.
    pub async fn join(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.task).await.is_ok()
    }
}

/// Spawn one worker for `unit`: exactly one child OS process plus a resource
/// monitor bound to its pid. Lifecycle partials go out on `tx`; the
/// scheduler merges and persists them.
pub fn spawn(
    run_guid: &str,
    unit: &TestUnit,
    executor: Arc<dyn TestExecutor>,
    monitor_period: Duration,
    tx: UnboundedSender<ProcessInfo>,
) -> WorkerHandle {
    let token = CancellationToken::new();
    let task = tokio::spawn(supervise(
        run_guid.to_string(),
        unit.clone(),
        executor,
        monitor_period,
        tx,
        token.clone(),
    ));
    WorkerHandle {
        name: unit.clone(),
        token,
        task,
    }
}

async fn supervise(
    run_guid: String,
    unit: TestUnit,
    executor: Arc<dyn TestExecutor>,
    monitor_period: Duration,
    tx: UnboundedSender<ProcessInfo>,
    token: CancellationToken,
) {
    let mut cmd = executor.command(&unit);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            // No RUNNING record was emitted; the scheduler's reconciliation
            // sweep will mark the unit TERMINATED.
            error!(unit = %unit, "failed to spawn test process: {}", e);
            return;
        }
    };
    let pid = child.id();
    info!(unit = %unit, ?pid, run_guid = %run_guid, "test process started");

    let mut running = ProcessInfo::new(&run_guid, &unit, ProcessState::Running);
    running.pid = pid;
    running.start = Some(Utc::now());
    let _ = tx.send(running);

    let monitor =
        pid.map(|p| ResourceMonitor::spawn(&run_guid, &unit, p, monitor_period, tx.clone()));

    // Drain both pipes concurrently so a chatty test cannot deadlock on a
    // full pipe buffer.
    let out_task = child.stdout.take().map(|s| tokio::spawn(read_all(s)));
    let err_task = child.stderr.take().map(|s| tokio::spawn(read_all(s)));

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = token.cancelled() => {
            info!(unit = %unit, ?pid, "terminating test process");
            if let Err(e) = child.start_kill() {
                warn!(unit = %unit, ?pid, "failed to terminate test process: {}", e);
            }
            if tokio::time::timeout(KILL_TIMEOUT, child.wait()).await.is_err() {
                warn!(unit = %unit, ?pid, "test process did not exit within {:?}", KILL_TIMEOUT);
            }
            None
        }
    };

    if let Some(monitor) = monitor {
        monitor.request_stop();
        if !monitor.join(MONITOR_JOIN_TIMEOUT).await {
            error!(unit = %unit, ?pid, "resource monitor did not stop in time");
        }
    }

    let Some(status) = status else {
        // Cancelled: no FINISHED record for this attempt. The scheduler
        // records the TERMINATED transition itself.
        return;
    };

    let mut output = String::new();
    for task in [out_task, err_task].into_iter().flatten() {
        match task.await {
            Ok(text) => output.push_str(&text),
            Err(e) => warn!(unit = %unit, "output capture task failed: {}", e),
        }
    }

    let exit_code = match status.code() {
        Some(code) => ExitOutcome::from_code(code),
        // Killed by a signal outside our control.
        None => ExitOutcome::Other(-1),
    };

    let mut finished = ProcessInfo::new(&run_guid, &unit, ProcessState::Finished);
    finished.pid = pid;
    finished.exit_code = Some(exit_code);
    finished.output = Some(output);
    finished.end = Some(Utc::now());
    let _ = tx.send(finished);

    info!(unit = %unit, ?pid, %exit_code, "test process finished");
}

async fn read_all(mut stream: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Arc<dyn TestExecutor> {
        Arc::new(CommandExecutor::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
        ))
    }

    async fn drain_until_terminal(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProcessInfo>,
    ) -> Vec<ProcessInfo> {
        let mut updates = Vec::new();
        while let Some(info) = rx.recv().await {
            let terminal = info.state.is_terminal();
            updates.push(info);
            if terminal {
                break;
            }
        }
        updates
    }

    #[tokio::test]
    async fn test_worker_reports_running_then_finished() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn(
            "run-1",
            &"tests/test_ok.sh".to_string(),
            shell("echo all good; exit 0"),
            Duration::from_millis(50),
            tx,
        );

        let updates = drain_until_terminal(&mut rx).await;
        assert!(handle.join(Duration::from_secs(10)).await);

        let first = &updates[0];
        assert_eq!(first.state, ProcessState::Running);
        assert!(first.pid.is_some());
        assert!(first.start.is_some());

        let last = updates.last().unwrap();
        assert_eq!(last.state, ProcessState::Finished);
        assert_eq!(last.exit_code, Some(ExitOutcome::Ok));
        assert!(last.output.as_deref().unwrap_or("").contains("all good"));
        assert!(last.end.is_some());
    }

    #[tokio::test]
    async fn test_worker_captures_failure_exit_code() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn(
            "run-1",
            &"tests/test_fail.sh".to_string(),
            shell("echo boom >&2; exit 1"),
            Duration::from_millis(50),
            tx,
        );

        let updates = drain_until_terminal(&mut rx).await;
        assert!(handle.join(Duration::from_secs(10)).await);

        let last = updates.last().unwrap();
        assert_eq!(last.state, ProcessState::Finished);
        assert_eq!(last.exit_code, Some(ExitOutcome::TestsFailed));
        assert!(last.output.as_deref().unwrap_or("").contains("boom"));
    }

    #[tokio::test]
    async fn test_cancelled_worker_emits_no_finished_record() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn(
            "run-1",
            &"tests/test_hang.sh".to_string(),
            shell("sleep 600"),
            Duration::from_millis(50),
            tx,
        );

        // Wait for the RUNNING partial, then cancel.
        let running = rx.recv().await.unwrap();
        assert_eq!(running.state, ProcessState::Running);

        handle.cancel();
        assert!(handle.join(Duration::from_secs(15)).await);

        // Any remaining updates are monitor samples, never FINISHED.
        while let Ok(info) = rx.try_recv() {
            assert_ne!(info.state, ProcessState::Finished);
        }
    }
}
