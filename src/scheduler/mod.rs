//! Test-run scheduler -- converts a fixed unit list plus a concurrency
//! budget into supervised worker processes, keeping the process info store
//! and the update channel consistent with reality.

pub mod engine;

pub use self::engine::run_scheduler_loop;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::model::{ProcessInfo, RunParameters, TestUnit};
use crate::storage::Pool;
use crate::worker::{TestExecutor, WorkerHandle};

/// Control operations accepted by the scheduler loop.
#[derive(Debug)]
pub enum Command {
    Run(RunParameters),
    Stop,
    Exit,
}

/// Cloneable control surface handed to the UI/CLI layer. All operations are
/// non-blocking sends; the scheduler loop applies them between ticks.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    update_tx: broadcast::Sender<ProcessInfo>,
}

impl SchedulerHandle {
    pub fn request_run(&self, params: RunParameters) {
        let _ = self.cmd_tx.send(Command::Run(params));
    }

    pub fn request_stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// Initiate teardown. Safe to call even if no run was ever started;
    /// waiting for the loop to actually finish is the caller's business.
    pub fn request_exit(&self) {
        let _ = self.cmd_tx.send(Command::Exit);
    }

    /// Subscribe to the update channel. Every state change is delivered as
    /// one `ProcessInfo`; a slow observer loses old events rather than ever
    /// blocking the scheduler.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessInfo> {
        self.update_tx.subscribe()
    }

    /// True while the scheduler loop is still alive.
    pub fn is_active(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Scheduler state. Owned exclusively by the engine loop; every mutation
/// happens from a tick or a control command, never concurrently.
pub struct Scheduler {
    pub(crate) pool: Pool,
    pub(crate) executor: Arc<dyn TestExecutor>,
    pub(crate) all_units: Vec<TestUnit>,
    pub(crate) tick_period: Duration,
    pub(crate) monitor_period: Duration,

    /// Parameters of the active run, if any.
    pub(crate) params: Option<RunParameters>,
    /// Units not yet started, FIFO.
    pub(crate) queue: VecDeque<TestUnit>,
    /// Live worker handles, kept until the unit's terminal state is
    /// confirmed in the store.
    pub(crate) workers: HashMap<TestUnit, WorkerHandle>,
    /// Ticks a unit has spent RUNNING in the store with no live worker.
    pub(crate) stale_ticks: HashMap<TestUnit, u32>,

    pub(crate) worker_tx: mpsc::UnboundedSender<ProcessInfo>,
    pub(crate) worker_rx: mpsc::UnboundedReceiver<ProcessInfo>,
    pub(crate) update_tx: broadcast::Sender<ProcessInfo>,
    pub(crate) cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Scheduler {
    /// Build a scheduler over the full unit list. Returns the scheduler
    /// (to be driven by [`run_scheduler_loop`]) and its control handle.
    pub fn new(
        pool: Pool,
        executor: Arc<dyn TestExecutor>,
        all_units: Vec<TestUnit>,
        tick_period: Duration,
        monitor_period: Duration,
    ) -> (Self, SchedulerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (update_tx, _) = broadcast::channel(1024);

        let handle = SchedulerHandle {
            cmd_tx,
            update_tx: update_tx.clone(),
        };
        let scheduler = Self {
            pool,
            executor,
            all_units,
            tick_period,
            monitor_period,
            params: None,
            queue: VecDeque::new(),
            workers: HashMap::new(),
            stale_ticks: HashMap::new(),
            worker_tx,
            worker_rx,
            update_tx,
            cmd_rx,
        };
        (scheduler, handle)
    }
}
