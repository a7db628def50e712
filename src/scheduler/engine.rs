//! Scheduler engine loop -- the periodic tick that dispatches workers,
//! drains partial updates, and reconciles persisted state.

use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::model::{merge_info, ProcessInfo, ProcessState, RunMode, RunParameters};
use crate::scheduler::{Command, Scheduler};
use crate::{monitor, storage, worker};

/// Bound on waiting for one worker's OS-level teardown during a stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Ticks a unit may sit RUNNING in the store with a dead worker before the
/// reconciliation sweep writes it off as TERMINATED.
const STALE_TICK_LIMIT: u32 = 3;

/// Drive the scheduler until `request_exit`. Control commands and the
/// periodic tick are serviced from this single task, so scheduler state is
/// never touched concurrently.
pub async fn run_scheduler_loop(mut scheduler: Scheduler) {
    info!(
        units = scheduler.all_units.len(),
        tick = ?scheduler.tick_period,
        "scheduler engine started"
    );

    let mut interval = tokio::time::interval(scheduler.tick_period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                scheduler.tick();
            }
            cmd = scheduler.cmd_rx.recv() => {
                match cmd {
                    Some(Command::Run(params)) => scheduler.handle_run(params).await,
                    Some(Command::Stop) => scheduler.handle_stop().await,
                    Some(Command::Exit) | None => {
                        scheduler.handle_stop().await;
                        break;
                    }
                }
            }
        }
    }

    info!("scheduler engine stopped");
}

impl Scheduler {
    /// Start a run. Any workers left over from a prior run are stopped
    /// first, so calling this twice is safe.
    pub(crate) async fn handle_run(&mut self, mut params: RunParameters) {
        if params.max_processes < 1 {
            warn!("max_processes below 1, clamping");
            params.max_processes = 1;
        }

        if !self.workers.is_empty() {
            warn!(live = self.workers.len(), "run requested with live workers, stopping them first");
            self.handle_stop().await;
        }

        let effective_mode = self.effective_run_mode(&params);
        let to_enqueue = self.select_units(effective_mode);
        info!(
            run_guid = %params.run_guid,
            mode = ?params.run_mode,
            effective = ?effective_mode,
            enqueued = to_enqueue.len(),
            max_processes = params.max_processes,
            "run requested"
        );

        self.queue.clear();
        self.stale_ticks.clear();
        for unit in to_enqueue {
            let queued = ProcessInfo::new(&params.run_guid, &unit, ProcessState::Queued);
            self.persist_and_announce(queued);
            self.queue.push_back(unit);
        }

        // Recorded last: observers treat a recorded run with no live rows as
        // already settled, so the QUEUED rows must land first.
        if let Err(e) =
            storage::record_run(&self.pool, &params.run_guid, params.fingerprint.as_deref())
        {
            error!(run_guid = %params.run_guid, "failed to record run: {}", e);
        }
        self.params = Some(params);
    }

    /// CHECK degrades to RESUME when the program under test is unchanged or
    /// no fingerprint is comparable, and to RESTART when it changed.
    fn effective_run_mode(&self, params: &RunParameters) -> RunMode {
        match params.run_mode {
            RunMode::Check => {
                let previous = match storage::latest_run(&self.pool) {
                    Ok(run) => run.and_then(|(_, fingerprint)| fingerprint),
                    Err(e) => {
                        warn!("failed to read prior run fingerprint: {}", e);
                        None
                    }
                };
                match (&params.fingerprint, previous) {
                    (Some(current), Some(prior)) if *current == prior => RunMode::Resume,
                    (Some(_), Some(_)) => RunMode::Restart,
                    // Nothing to compare: be conservative and resume.
                    _ => RunMode::Resume,
                }
            }
            mode => mode,
        }
    }

    /// The unit list to enqueue for this run, in the fixed suite order.
    fn select_units(&self, mode: RunMode) -> Vec<String> {
        match mode {
            RunMode::Restart => self.all_units.clone(),
            RunMode::Resume | RunMode::Check => {
                // A unit's most recent prior record may live in any run.
                let prior = match storage::query_all(&self.pool) {
                    Ok(rows) => storage::latest_by_unit(&rows),
                    Err(e) => {
                        warn!("failed to query prior run, rerunning everything: {}", e);
                        return self.all_units.clone();
                    }
                };
                self.all_units
                    .iter()
                    .filter(|unit| {
                        let passed = prior.get(*unit).is_some_and(|info| {
                            info.state == ProcessState::Finished
                                && info.exit_code.is_some_and(|code| code.is_success())
                        });
                        !passed
                    })
                    .cloned()
                    .collect()
            }
        }
    }

    /// Stop the active run: terminate every live worker and record the
    /// TERMINATED transition for each unit still RUNNING in the store.
    pub(crate) async fn handle_stop(&mut self) {
        let Some(run_guid) = self.params.as_ref().map(|p| p.run_guid.clone()) else {
            return;
        };
        info!(run_guid = %run_guid, live = self.workers.len(), "stop requested");

        // No new dispatch after a stop; still-queued units keep their QUEUED
        // record and are picked up again by a later resume run.
        self.queue.clear();

        for (_, handle) in self.workers.iter() {
            handle.cancel();
        }
        for (unit, handle) in self.workers.drain() {
            if !handle.join(STOP_TIMEOUT).await {
                // Best effort: insufficient permission or a wedged kill is
                // logged, the unit is marked TERMINATED regardless.
                warn!(unit = %unit, "worker did not stop within {:?}", STOP_TIMEOUT);
            }
        }
        self.stale_ticks.clear();

        // Absorb final updates from workers that finished during teardown
        // so a legitimate FINISHED result is not stamped TERMINATED.
        let latest = self.drain_worker_updates(&run_guid);

        for info in latest.into_values() {
            if info.state == ProcessState::Running {
                let mut terminated = info;
                terminated.state = ProcessState::Terminated;
                terminated.end = Some(Utc::now());
                terminated.time_stamp = Utc::now();
                self.persist_and_announce(terminated);
            }
        }
    }

    /// One scheduler tick: dispatch into free slots, drain partial updates,
    /// release finished workers, sweep for stale RUNNING rows.
    pub(crate) fn tick(&mut self) {
        let Some(params) = self.params.clone() else {
            return;
        };
        let run_guid = params.run_guid;

        // The persisted store is the source of truth for what is running.
        let rows = match storage::query(&self.pool, Some(&run_guid)) {
            Ok(rows) => rows,
            Err(e) => {
                error!(run_guid = %run_guid, "tick query failed: {}", e);
                return;
            }
        };
        let latest = storage::latest_by_unit(&rows);
        let running_count = latest
            .values()
            .filter(|info| info.state == ProcessState::Running)
            .count();

        let slots = params.max_processes.saturating_sub(running_count);
        for _ in 0..slots {
            let Some(unit) = self.queue.pop_front() else {
                break;
            };
            let handle = worker::spawn(
                &run_guid,
                &unit,
                self.executor.clone(),
                self.monitor_period,
                self.worker_tx.clone(),
            );
            self.workers.insert(unit.clone(), handle);
            // pid and start are supplied by the worker's own first partial.
            let running = ProcessInfo::new(&run_guid, &unit, ProcessState::Running);
            self.persist_and_announce(running);
        }

        let latest = self.drain_worker_updates(&run_guid);

        // Keep a live reference to every worker until its terminal state is
        // confirmed in the store, then let it go.
        self.workers.retain(|unit, handle| {
            let terminal = latest
                .get(unit)
                .map(|info| info.state.is_terminal())
                .unwrap_or(false);
            !(terminal && handle.is_finished())
        });

        self.reconcile(&latest);
    }

    /// Drain all pending worker partials (non-blocking), merge each into the
    /// last known record, persist and announce. Returns the refreshed
    /// latest-per-unit view.
    fn drain_worker_updates(
        &mut self,
        run_guid: &str,
    ) -> std::collections::HashMap<String, ProcessInfo> {
        let rows = match storage::query(&self.pool, Some(run_guid)) {
            Ok(rows) => rows,
            Err(e) => {
                error!("drain query failed: {}", e);
                Vec::new()
            }
        };
        let mut latest = storage::latest_by_unit(&rows);

        while let Ok(mut partial) = self.worker_rx.try_recv() {
            if partial.run_guid != run_guid {
                // Straggler from a previous run; its lineage is closed.
                continue;
            }
            partial.time_stamp = Utc::now();
            let merged = match latest.get(&partial.name) {
                Some(base) => merge_info(base, &partial),
                None => partial.clone(),
            };
            latest.insert(merged.name.clone(), merged.clone());
            self.persist_and_announce(merged);
        }

        latest
    }

    /// Reconciliation sweep: a unit RUNNING in the store whose worker is
    /// gone and whose pid is dead gets written off as TERMINATED after a few
    /// ticks of grace.
    fn reconcile(&mut self, latest: &std::collections::HashMap<String, ProcessInfo>) {
        for (unit, info) in latest {
            if info.state != ProcessState::Running {
                self.stale_ticks.remove(unit);
                continue;
            }
            let worker_alive = self
                .workers
                .get(unit)
                .map(|handle| !handle.is_finished())
                .unwrap_or(false);
            if worker_alive {
                self.stale_ticks.remove(unit);
                continue;
            }

            let ticks = self.stale_ticks.entry(unit.clone()).or_insert(0);
            *ticks += 1;
            if *ticks <= STALE_TICK_LIMIT {
                continue;
            }
            let pid_alive = info.pid.map(monitor::pid_is_running).unwrap_or(false);
            if pid_alive {
                continue;
            }

            warn!(unit = %unit, pid = ?info.pid, "worker vanished without a result, marking terminated");
            let mut terminated = info.clone();
            terminated.state = ProcessState::Terminated;
            terminated.end = Some(Utc::now());
            terminated.time_stamp = Utc::now();
            self.persist_and_announce(terminated);
            self.stale_ticks.remove(unit);
            self.workers.remove(unit);
        }
    }

    /// Write one record through to the store and announce it on the update
    /// channel. A transient store failure is logged; the next natural update
    /// retries the write path.
    pub(crate) fn persist_and_announce(&self, info: ProcessInfo) {
        if let Err(e) = storage::write(&self.pool, &info) {
            error!(unit = %info.name, "failed to persist process info: {}", e);
        }
        let _ = self.update_tx.send(info);
    }
}
