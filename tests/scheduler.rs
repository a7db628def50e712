//! End-to-end scheduler runs with real (tiny) OS processes.
//!
//! The runner is `sh -c '<script>' <unit>`, so the unit name lands in `$0`
//! and scripts can pass or fail by name.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use testflight::model::{ProcessState, RunMode, RunParameters};
use testflight::scheduler::{run_scheduler_loop, Scheduler, SchedulerHandle};
use testflight::storage::{self, Pool};
use testflight::worker::{CommandExecutor, TestExecutor};

const TICK: Duration = Duration::from_millis(100);
const SETTLE_DEADLINE: Duration = Duration::from_secs(60);

fn temp_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testflight.db");
    let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
    (dir, pool)
}

fn sh(script: &str) -> Arc<dyn TestExecutor> {
    Arc::new(CommandExecutor::new(
        "sh",
        vec!["-c".to_string(), script.to_string()],
    ))
}

fn start(
    pool: &Pool,
    executor: Arc<dyn TestExecutor>,
    units: &[&str],
) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
    let units = units.iter().map(|u| u.to_string()).collect();
    let (scheduler, handle) = Scheduler::new(
        pool.clone(),
        executor,
        units,
        TICK,
        Duration::from_millis(100),
    );
    let engine = tokio::spawn(run_scheduler_loop(scheduler));
    (handle, engine)
}

/// Poll the store until every row for the run is terminal (and at least
/// `expected` units have rows).
async fn wait_settled(pool: &Pool, run_guid: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + SETTLE_DEADLINE;
    loop {
        let rows = storage::query(pool, Some(run_guid)).unwrap();
        let latest = storage::latest_by_unit(&rows);
        if latest.len() >= expected && latest.values().all(|info| info.state.is_terminal()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} did not settle: {:?}",
            run_guid,
            latest
                .values()
                .map(|i| (i.name.clone(), i.state))
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn shut_down(handle: SchedulerHandle, engine: tokio::task::JoinHandle<()>) {
    handle.request_exit();
    tokio::time::timeout(Duration::from_secs(30), engine)
        .await
        .expect("scheduler loop did not exit")
        .unwrap();
}

/// Walk rows in time order and compute the peak number of units that were
/// RUNNING at the same moment, per the persisted state machine.
fn peak_running(pool: &Pool, run_guid: &str) -> usize {
    let rows = storage::query(pool, Some(run_guid)).unwrap();
    let mut state: std::collections::HashMap<String, ProcessState> = Default::default();
    let mut peak = 0;
    for row in rows {
        state.insert(row.name.clone(), row.state);
        let running = state
            .values()
            .filter(|s| **s == ProcessState::Running)
            .count();
        peak = peak.max(running);
    }
    peak
}

#[tokio::test]
async fn test_five_units_two_slots_all_finish_within_budget() {
    let (_dir, pool) = temp_pool();
    let units = ["test_a", "test_b", "test_c", "test_d", "test_e"];
    let (handle, engine) = start(&pool, sh("sleep 0.3; exit 0"), &units);

    let params = RunParameters::new(RunMode::Restart, 2);
    let run_guid = params.run_guid.clone();
    handle.request_run(params);

    wait_settled(&pool, &run_guid, units.len()).await;
    shut_down(handle, engine).await;

    let rows = storage::query(&pool, Some(&run_guid)).unwrap();
    let latest = storage::latest_by_unit(&rows);
    assert_eq!(latest.len(), 5);
    for info in latest.values() {
        assert_eq!(info.state, ProcessState::Finished, "unit {}", info.name);
        assert!(info.exit_code.unwrap().is_success());
        assert!(info.pid.is_some());
        assert!(info.start.is_some());
        assert!(info.end.is_some());
    }

    assert!(
        peak_running(&pool, &run_guid) <= 2,
        "concurrency budget exceeded"
    );
}

#[tokio::test]
async fn test_zero_budget_clamps_to_one_at_a_time() {
    let (_dir, pool) = temp_pool();
    let units = ["test_a", "test_b", "test_c"];
    let (handle, engine) = start(&pool, sh("sleep 0.2; exit 0"), &units);

    let params = RunParameters::new(RunMode::Restart, 0);
    assert_eq!(params.max_processes, 1);
    let run_guid = params.run_guid.clone();
    handle.request_run(params);

    wait_settled(&pool, &run_guid, units.len()).await;
    shut_down(handle, engine).await;

    assert_eq!(peak_running(&pool, &run_guid), 1);
}

#[tokio::test]
async fn test_resume_skips_passed_units_and_reruns_failures() {
    let (_dir, pool) = temp_pool();
    let script = r#"case "$0" in *fail*) exit 1 ;; *) exit 0 ;; esac"#;

    // First run: one pass, one failure.
    let (handle, engine) = start(&pool, sh(script), &["test_pass_a", "test_fail_b"]);
    let params = RunParameters::new(RunMode::Restart, 2);
    let first_run = params.run_guid.clone();
    handle.request_run(params);
    wait_settled(&pool, &first_run, 2).await;
    shut_down(handle, engine).await;

    let latest = storage::latest_by_unit(&storage::query(&pool, Some(&first_run)).unwrap());
    assert!(latest["test_pass_a"].exit_code.unwrap().is_success());
    assert!(!latest["test_fail_b"].exit_code.unwrap().is_success());

    // Second run resumes, with a unit that has never run before.
    let (handle, engine) = start(
        &pool,
        sh(script),
        &["test_pass_a", "test_fail_b", "test_new_c"],
    );
    let params = RunParameters::new(RunMode::Resume, 2);
    let second_run = params.run_guid.clone();
    handle.request_run(params);
    wait_settled(&pool, &second_run, 2).await;
    shut_down(handle, engine).await;

    let rows = storage::query(&pool, Some(&second_run)).unwrap();
    let names: HashSet<_> = rows.iter().map(|r| r.name.as_str()).collect();
    assert!(
        !names.contains("test_pass_a"),
        "passed unit was re-enqueued: {:?}",
        names
    );
    assert!(names.contains("test_fail_b"));
    assert!(names.contains("test_new_c"));
}

#[tokio::test]
async fn test_stop_terminates_live_workers_and_leaves_queue_intact() {
    let (_dir, pool) = temp_pool();
    let units = ["test_a", "test_b", "test_c", "test_d", "test_e"];
    let (handle, engine) = start(&pool, sh("sleep 600"), &units);

    let params = RunParameters::new(RunMode::Restart, 2);
    let run_guid = params.run_guid.clone();
    handle.request_run(params);

    // Wait until two workers report RUNNING with a pid.
    let deadline = tokio::time::Instant::now() + SETTLE_DEADLINE;
    loop {
        let latest = storage::latest_by_unit(&storage::query(&pool, Some(&run_guid)).unwrap());
        let running_with_pid = latest
            .values()
            .filter(|i| i.state == ProcessState::Running && i.pid.is_some())
            .count();
        if running_with_pid == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workers never started");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.request_stop();

    // After the stop settles, nothing is left running.
    let deadline = tokio::time::Instant::now() + SETTLE_DEADLINE;
    let latest = loop {
        let latest = storage::latest_by_unit(&storage::query(&pool, Some(&run_guid)).unwrap());
        if latest.values().all(|i| i.state != ProcessState::Running) {
            break latest;
        }
        assert!(tokio::time::Instant::now() < deadline, "stop never settled");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    shut_down(handle, engine).await;

    let terminated: Vec<_> = latest
        .values()
        .filter(|i| i.state == ProcessState::Terminated)
        .collect();
    let queued = latest
        .values()
        .filter(|i| i.state == ProcessState::Queued)
        .count();
    assert_eq!(terminated.len(), 2);
    assert_eq!(queued, 3);
    for info in terminated {
        assert!(info.end.is_some());
        let pid = info.pid.expect("terminated unit had started");
        assert!(
            !testflight::monitor::pid_is_running(pid),
            "pid {} still alive after stop",
            pid
        );
    }
}

#[tokio::test]
async fn test_unspawnable_runner_is_reconciled_to_terminated() {
    let (_dir, pool) = temp_pool();
    // The runner binary does not exist, so the worker dies before it can
    // report anything. The reconciliation sweep must retire the unit.
    let executor: Arc<dyn TestExecutor> =
        Arc::new(CommandExecutor::new("/no/such/runner", Vec::new()));
    let (handle, engine) = start(&pool, executor, &["test_a"]);

    let params = RunParameters::new(RunMode::Restart, 1);
    let run_guid = params.run_guid.clone();
    handle.request_run(params);

    wait_settled(&pool, &run_guid, 1).await;
    shut_down(handle, engine).await;

    let latest = storage::latest_by_unit(&storage::query(&pool, Some(&run_guid)).unwrap());
    let info = &latest["test_a"];
    assert_eq!(info.state, ProcessState::Terminated);
    assert!(info.end.is_some());
    // No process ever started, so no pid or result fields were recorded.
    assert!(info.pid.is_none());
    assert!(info.exit_code.is_none());
}

#[tokio::test]
async fn test_check_mode_honors_fingerprint() {
    let (_dir, pool) = temp_pool();
    let units = ["test_a", "test_b"];

    // Baseline: everything passes under fingerprint v1.
    let (handle, engine) = start(&pool, sh("exit 0"), &units);
    let params = RunParameters::new(RunMode::Restart, 2).with_fingerprint(Some("v1".to_string()));
    let first_run = params.run_guid.clone();
    handle.request_run(params);
    wait_settled(&pool, &first_run, 2).await;
    shut_down(handle, engine).await;

    // Unchanged program: check behaves as resume, nothing to do.
    let (handle, engine) = start(&pool, sh("exit 0"), &units);
    let params = RunParameters::new(RunMode::Check, 2).with_fingerprint(Some("v1".to_string()));
    let second_run = params.run_guid.clone();
    handle.request_run(params);
    wait_settled(&pool, &second_run, 0).await;
    shut_down(handle, engine).await;
    assert!(storage::query(&pool, Some(&second_run)).unwrap().is_empty());

    // Changed program: check behaves as restart, everything runs again.
    let (handle, engine) = start(&pool, sh("exit 0"), &units);
    let params = RunParameters::new(RunMode::Check, 2).with_fingerprint(Some("v2".to_string()));
    let third_run = params.run_guid.clone();
    handle.request_run(params);
    wait_settled(&pool, &third_run, 2).await;
    shut_down(handle, engine).await;
    assert_eq!(
        storage::latest_by_unit(&storage::query(&pool, Some(&third_run)).unwrap()).len(),
        2
    );
}
