//! Per-process resource sampling -- CPU and memory utilization of one
//! worker process, emitted as partial `ProcessInfo` updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::model::{ProcessInfo, ProcessState};

/// One CPU/memory reading for a process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSample {
    /// CPU utilization as a percentage (100.0 = one full core).
    pub cpu_percent: f64,
    /// Resident memory as a percentage of total system memory.
    pub memory_percent: f64,
}

/// OS process stats, abstracted so tests can run without real processes.
pub trait ProcessStats: Send {
    /// Establish the CPU measurement baseline. The primed value is never
    /// reported; without this the first interval would read a spurious 0%.
    fn prime(&mut self);

    /// One reading, or `None` if the process is gone.
    fn sample(&mut self) -> Option<StatSample>;
}

/// [`ProcessStats`] backed by the `sysinfo` crate.
pub struct SysinfoStats {
    sys: System,
    pid: Pid,
}

impl SysinfoStats {
    pub fn new(pid: u32) -> Self {
        Self {
            sys: System::new(),
            pid: Pid::from_u32(pid),
        }
    }
}

impl ProcessStats for SysinfoStats {
    fn prime(&mut self) {
        self.sys.refresh_memory();
        self.sys.refresh_process(self.pid);
    }

    fn sample(&mut self) -> Option<StatSample> {
        if !self.sys.refresh_process(self.pid) {
            return None;
        }
        self.sys.refresh_memory();
        let process = self.sys.process(self.pid)?;
        let total = self.sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            process.memory() as f64 / total as f64 * 100.0
        };
        Some(StatSample {
            cpu_percent: process.cpu_usage() as f64,
            memory_percent,
        })
    }
}

/// Whether an OS process with the given pid is currently alive.
pub fn pid_is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_process(Pid::from_u32(pid))
}

/// Samples one worker process on a fixed period from a dedicated thread,
/// emitting a partial `ProcessInfo` (pid, cpu, memory) per cycle until asked
/// to stop. A vanished process skips the cycle silently; the sampler keeps
/// cycling until the stop flag is set.
pub struct ResourceMonitor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    /// Start sampling `pid` with the default sysinfo backend.
    pub fn spawn(
        run_guid: &str,
        name: &str,
        pid: u32,
        period: Duration,
        tx: UnboundedSender<ProcessInfo>,
    ) -> Self {
        Self::spawn_with_stats(run_guid, name, pid, period, tx, SysinfoStats::new(pid))
    }

    /// Start sampling with a caller-supplied stats backend (tests).
    pub fn spawn_with_stats<S: ProcessStats + 'static>(
        run_guid: &str,
        name: &str,
        pid: u32,
        period: Duration,
        tx: UnboundedSender<ProcessInfo>,
        mut stats: S,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let run_guid = run_guid.to_string();
        let name = name.to_string();

        let handle = std::thread::spawn(move || {
            stats.prime();
            loop {
                if stop_flag.load(Ordering::Relaxed) {
                    // One last reading if the process is still alive.
                    if let Some(sample) = stats.sample() {
                        let _ = tx.send(partial_update(&run_guid, &name, pid, sample));
                    }
                    break;
                }
                std::thread::sleep(period);
                match stats.sample() {
                    Some(sample) => {
                        if tx.send(partial_update(&run_guid, &name, pid, sample)).is_err() {
                            // Receiver gone, nothing left to report to.
                            break;
                        }
                    }
                    // Expected race: the process exited between cycles.
                    None => debug!(unit = %name, pid, "monitored process not running, skipping sample"),
                }
            }
        });

        Self { stop, handle }
    }

    /// Signal the sampling loop to take a final sample and exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait up to `timeout` for the sampling thread to exit. Returns false
    /// if it is still running when the timeout elapses.
    pub async fn join(self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.handle.is_finished() {
                let _ = self.handle.join();
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn partial_update(run_guid: &str, name: &str, pid: u32, sample: StatSample) -> ProcessInfo {
    let mut info = ProcessInfo::new(run_guid, name, ProcessState::Unknown);
    info.pid = Some(pid);
    info.cpu_percent = Some(sample.cpu_percent);
    info.memory_percent = Some(sample.memory_percent);
    info
}
