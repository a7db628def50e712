//! SQLite storage layer -- the process info store.
//!
//! Append-only rows keyed by `(run_guid, name)`; the temporally-last row per
//! unit wins. The scheduler is the only writer, but every write goes through
//! a bounded retry so transient lock contention never surfaces as a failure.

pub mod schema;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};
use thiserror::Error;

use crate::model::{ExitOutcome, ProcessInfo, ProcessState, TestUnit};

/// Connection pool type.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database still busy after {attempts} attempts")]
    Busy { attempts: u32 },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> anyhow::Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Run one storage operation, retrying with backoff on lock contention.
fn with_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, StoreError> {
    let mut delay = Duration::from_millis(25);
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked =>
            {
                if attempt == MAX_WRITE_ATTEMPTS {
                    return Err(StoreError::Busy {
                        attempts: MAX_WRITE_ATTEMPTS,
                    });
                }
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry loop always returns")
}

fn encode_time(ts: &DateTime<Utc>) -> String {
    // Fixed-width fractional seconds keep lexicographic order chronological.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Append one immutable `ProcessInfo` row. Never overwrites.
pub fn write(pool: &Pool, info: &ProcessInfo) -> Result<(), StoreError> {
    let conn = pool.get()?;
    with_retry(|| {
        conn.execute(
            "INSERT INTO process_info
             (run_guid, name, state, pid, exit_code, output, start, end,
              cpu_percent, memory_percent, time_stamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                info.run_guid,
                info.name,
                info.state.as_str(),
                info.pid.map(|p| p as i64),
                info.exit_code.map(|c| c.code() as i64),
                info.output,
                info.start.as_ref().map(encode_time),
                info.end.as_ref().map(encode_time),
                info.cpu_percent,
                info.memory_percent,
                encode_time(&info.time_stamp),
            ],
        )
        .map(|_| ())
    })
}

fn row_to_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessInfo> {
    Ok(ProcessInfo {
        run_guid: row.get("run_guid")?,
        name: row.get("name")?,
        state: ProcessState::from_str(&row.get::<_, String>("state")?),
        pid: row.get::<_, Option<i64>>("pid")?.map(|p| p as u32),
        exit_code: row
            .get::<_, Option<i64>>("exit_code")?
            .map(|c| ExitOutcome::from_code(c as i32)),
        output: row.get("output")?,
        start: row
            .get::<_, Option<String>>("start")?
            .as_deref()
            .and_then(decode_time),
        end: row
            .get::<_, Option<String>>("end")?
            .as_deref()
            .and_then(decode_time),
        cpu_percent: row.get("cpu_percent")?,
        memory_percent: row.get("memory_percent")?,
        time_stamp: row
            .get::<_, String>("time_stamp")
            .map(|s| decode_time(&s).unwrap_or_default())?,
    })
}

/// All rows for one run, oldest first. With `run_guid` omitted, the most
/// recently written run is selected. An empty store yields an empty vec.
pub fn query(pool: &Pool, run_guid: Option<&str>) -> Result<Vec<ProcessInfo>, StoreError> {
    let conn = pool.get()?;

    let run_guid = match run_guid {
        Some(guid) => guid.to_string(),
        None => {
            let latest: Option<String> = conn
                .query_row(
                    "SELECT run_guid FROM process_info ORDER BY time_stamp DESC, id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match latest {
                Some(guid) => guid,
                None => return Ok(Vec::new()),
            }
        }
    };

    let mut stmt = conn.prepare(
        "SELECT * FROM process_info WHERE run_guid = ?1 ORDER BY time_stamp ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([&run_guid], row_to_info)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Every row across every run, oldest first. Used by resume-mode run
/// selection, where a unit's most recent prior record may live in an older
/// run than the latest one.
pub fn query_all(pool: &Pool) -> Result<Vec<ProcessInfo>, StoreError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT * FROM process_info ORDER BY time_stamp ASC, id ASC")?;
    let rows = stmt
        .query_map([], row_to_info)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Collapse a time-ordered row list to the last row per unit name.
pub fn latest_by_unit(rows: &[ProcessInfo]) -> HashMap<TestUnit, ProcessInfo> {
    let mut latest = HashMap::new();
    for row in rows {
        latest.insert(row.name.clone(), row.clone());
    }
    latest
}

/// Remove rows for one run, or every row when `run_guid` is omitted.
pub fn delete(pool: &Pool, run_guid: Option<&str>) -> Result<(), StoreError> {
    let conn = pool.get()?;
    with_retry(|| {
        match run_guid {
            Some(guid) => {
                conn.execute("DELETE FROM process_info WHERE run_guid = ?1", [guid])?;
                conn.execute("DELETE FROM runs WHERE run_guid = ?1", [guid])?;
            }
            None => {
                conn.execute("DELETE FROM process_info", [])?;
                conn.execute("DELETE FROM runs", [])?;
            }
        }
        Ok(())
    })
}

/// Record one run invocation and its program fingerprint (for check mode).
pub fn record_run(pool: &Pool, run_guid: &str, fingerprint: Option<&str>) -> Result<(), StoreError> {
    let conn = pool.get()?;
    let created_at = encode_time(&Utc::now());
    with_retry(|| {
        conn.execute(
            "INSERT OR REPLACE INTO runs (run_guid, fingerprint, created_at) VALUES (?1, ?2, ?3)",
            params![run_guid, fingerprint, created_at],
        )
        .map(|_| ())
    })
}

/// The most recently recorded run and its fingerprint, if any.
pub fn latest_run(pool: &Pool) -> Result<Option<(String, Option<String>)>, StoreError> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT run_guid, fingerprint FROM runs ORDER BY created_at DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;
    Ok(row)
}
