//! Testflight -- parallel test-run scheduling and process supervision.
//!
//! This crate schedules a fixed collection of test units across a bounded
//! pool of worker OS processes, samples per-process CPU/memory usage,
//! persists every lifecycle transition to a local SQLite database keyed by
//! run identifier, and emits each transition on a non-blocking update
//! channel for external observers.

pub mod config;
pub mod discovery;
pub mod model;
pub mod monitor;
pub mod scheduler;
pub mod storage;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::model::{ProcessInfo, ProcessState, RunParameters, TestUnit};
use crate::scheduler::{run_scheduler_loop, Scheduler};
use crate::storage::Pool;
use crate::worker::TestExecutor;

/// Tally of one completed (or stopped) run.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RunSummary {
    pub run_guid: String,
    pub passed: usize,
    pub failed: usize,
    pub terminated: usize,
    pub queued: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.terminated == 0 && self.queued == 0
    }
}

/// Drive one full run to completion: start the scheduler engine, request the
/// run, forward every update to `on_update`, and return the final tally.
///
/// Ctrl-C requests a stop (workers are terminated, queued units are left for
/// a later resume run) and the summary reflects whatever state was reached.
pub async fn run_suite(
    pool: Pool,
    executor: Arc<dyn TestExecutor>,
    units: Vec<TestUnit>,
    params: RunParameters,
    tick_period: Duration,
    monitor_period: Duration,
    mut on_update: impl FnMut(&ProcessInfo),
) -> Result<RunSummary> {
    let run_guid = params.run_guid.clone();
    let (scheduler, handle) =
        Scheduler::new(pool.clone(), executor, units, tick_period, monitor_period);
    let mut updates = handle.subscribe();
    let engine = tokio::spawn(run_scheduler_loop(scheduler));

    handle.request_run(params);

    let mut poll = tokio::time::interval(tick_period);
    let mut stopping = false;
    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(info) => on_update(&info),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "observer lagged behind the update channel");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("interrupt received, stopping the run");
                handle.request_stop();
                stopping = true;
            }
            _ = poll.tick() => {
                if run_is_settled(&pool, &run_guid, stopping)? {
                    break;
                }
            }
        }
    }

    handle.request_exit();
    let _ = engine.await;

    summarize(&pool, &run_guid)
}

/// A run is settled once it has been recorded and no unit can still make
/// progress: everything terminal, or (after a stop) nothing running.
fn run_is_settled(pool: &Pool, run_guid: &str, stopped: bool) -> Result<bool> {
    let recorded = storage::latest_run(pool)?
        .map(|(guid, _)| guid == run_guid)
        .unwrap_or(false);
    if !recorded {
        return Ok(false);
    }
    let rows = storage::query(pool, Some(run_guid))?;
    let latest = storage::latest_by_unit(&rows);
    let settled = if stopped {
        latest
            .values()
            .all(|info| info.state != ProcessState::Running)
    } else {
        latest.values().all(|info| info.state.is_terminal())
    };
    Ok(settled)
}

fn summarize(pool: &Pool, run_guid: &str) -> Result<RunSummary> {
    let rows = storage::query(pool, Some(run_guid))?;
    let latest = storage::latest_by_unit(&rows);

    let mut summary = RunSummary {
        run_guid: run_guid.to_string(),
        ..Default::default()
    };
    for info in latest.values() {
        match info.state {
            ProcessState::Finished => {
                if info.exit_code.is_some_and(|code| code.is_success()) {
                    summary.passed += 1;
                } else {
                    summary.failed += 1;
                }
            }
            ProcessState::Terminated => summary.terminated += 1,
            _ => summary.queued += 1,
        }
    }
    Ok(summary)
}
