//! Core data model -- test units, process lifecycle states, run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one schedulable test unit (a test file or module path).
pub type TestUnit = String;

/// Lifecycle state of one test unit's process within a run.
///
/// States only ever move forward: QUEUED -> RUNNING -> {FINISHED, TERMINATED}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Unknown,
    Queued,
    Running,
    Finished,
    Terminated,
}

impl ProcessState {
    /// Total order used to forbid state regression during merges.
    pub fn order(&self) -> u8 {
        match self {
            ProcessState::Unknown => 0,
            ProcessState::Queued => 1,
            ProcessState::Running => 2,
            ProcessState::Finished => 3,
            ProcessState::Terminated => 4,
        }
    }

    /// True for FINISHED and TERMINATED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Finished | ProcessState::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Unknown => "unknown",
            ProcessState::Queued => "queued",
            ProcessState::Running => "running",
            ProcessState::Finished => "finished",
            ProcessState::Terminated => "terminated",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => ProcessState::Queued,
            "running" => ProcessState::Running,
            "finished" => ProcessState::Finished,
            "terminated" => ProcessState::Terminated,
            _ => ProcessState::Unknown,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Enumerated outcome of one test-unit process.
///
/// `None` in a `ProcessInfo` is the "no code yet" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitOutcome {
    Ok,
    TestsFailed,
    Interrupted,
    InternalError,
    UsageError,
    NoTestsCollected,
    /// Any raw exit code outside the enumerated set.
    Other(i32),
}

impl ExitOutcome {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitOutcome::Ok,
            1 => ExitOutcome::TestsFailed,
            2 => ExitOutcome::Interrupted,
            3 => ExitOutcome::InternalError,
            4 => ExitOutcome::UsageError,
            5 => ExitOutcome::NoTestsCollected,
            other => ExitOutcome::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ExitOutcome::Ok => 0,
            ExitOutcome::TestsFailed => 1,
            ExitOutcome::Interrupted => 2,
            ExitOutcome::InternalError => 3,
            ExitOutcome::UsageError => 4,
            ExitOutcome::NoTestsCollected => 5,
            ExitOutcome::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Ok)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Ok => write!(f, "ok"),
            ExitOutcome::TestsFailed => write!(f, "tests-failed"),
            ExitOutcome::Interrupted => write!(f, "interrupted"),
            ExitOutcome::InternalError => write!(f, "internal-error"),
            ExitOutcome::UsageError => write!(f, "usage-error"),
            ExitOutcome::NoTestsCollected => write!(f, "no-tests-collected"),
            ExitOutcome::Other(code) => write!(f, "exit-{}", code),
        }
    }
}

/// The central record: everything known about one test unit's process at one
/// point in time. Rows are append-only in storage; the temporally-last row
/// per `(run_guid, name)` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub run_guid: String,
    pub name: TestUnit,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<ExitOutcome>,
    pub output: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub time_stamp: DateTime<Utc>,
}

impl ProcessInfo {
    /// Fresh record for a unit in the given state, all optional fields unset.
    pub fn new(run_guid: &str, name: &str, state: ProcessState) -> Self {
        Self {
            run_guid: run_guid.to_string(),
            name: name.to_string(),
            state,
            pid: None,
            exit_code: None,
            output: None,
            start: None,
            end: None,
            cpu_percent: None,
            memory_percent: None,
            time_stamp: Utc::now(),
        }
    }
}

/// Merge a partial update into the last known record for a unit.
///
/// Field rules:
/// - `Some` in the partial wins; `None` leaves the base value intact, so a
///   cpu/mem-only sample can never null out `exit_code`, `output` or `start`.
/// - `state` only ever moves forward along the lifecycle order.
/// - `time_stamp` takes the later of the two.
pub fn merge_info(base: &ProcessInfo, partial: &ProcessInfo) -> ProcessInfo {
    let state = if partial.state.order() > base.state.order() {
        partial.state
    } else {
        base.state
    };
    ProcessInfo {
        run_guid: base.run_guid.clone(),
        name: base.name.clone(),
        state,
        pid: partial.pid.or(base.pid),
        exit_code: partial.exit_code.or(base.exit_code),
        output: partial.output.clone().or_else(|| base.output.clone()),
        start: partial.start.or(base.start),
        end: partial.end.or(base.end),
        cpu_percent: partial.cpu_percent.or(base.cpu_percent),
        memory_percent: partial.memory_percent.or(base.memory_percent),
        time_stamp: partial.time_stamp.max(base.time_stamp),
    }
}

/// How a new run treats history from prior runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Rerun every test unit unconditionally.
    Restart,
    /// Skip units whose most recent recorded outcome was a successful finish.
    Resume,
    /// Resume if the program under test is unchanged, otherwise restart.
    Check,
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "restart" => Ok(RunMode::Restart),
            "resume" => Ok(RunMode::Resume),
            "check" => Ok(RunMode::Check),
            other => anyhow::bail!("unknown run mode '{}'", other),
        }
    }
}

/// Parameters for one "run all tests" invocation.
#[derive(Debug, Clone)]
pub struct RunParameters {
    pub run_guid: String,
    pub run_mode: RunMode,
    pub max_processes: usize,
    /// Fingerprint of the program under test, used by [`RunMode::Check`] to
    /// decide between resume and restart. `None` degrades Check to Resume.
    pub fingerprint: Option<String>,
}

impl RunParameters {
    pub fn new(run_mode: RunMode, max_processes: usize) -> Self {
        Self {
            run_guid: Uuid::new_v4().to_string(),
            run_mode,
            // A budget below one process can never make progress.
            max_processes: max_processes.max(1),
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.fingerprint = fingerprint;
        self
    }
}
