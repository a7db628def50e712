//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;
use tracing::warn;

/// Expected column set of the `process_info` table, in declaration order.
/// Used to detect an incompatible schema left behind by another version.
const PROCESS_INFO_COLUMNS: &[&str] = &[
    "id",
    "run_guid",
    "name",
    "state",
    "pid",
    "exit_code",
    "output",
    "start",
    "end",
    "cpu_percent",
    "memory_percent",
    "time_stamp",
];

const CREATE_PROCESS_INFO: &str = "CREATE TABLE IF NOT EXISTS process_info (
    id INTEGER PRIMARY KEY,
    run_guid TEXT NOT NULL,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    pid INTEGER,
    exit_code INTEGER,
    output TEXT,
    start TEXT,
    end TEXT,
    cpu_percent REAL,
    memory_percent REAL,
    time_stamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_process_info_run ON process_info(run_guid);
CREATE INDEX IF NOT EXISTS idx_process_info_run_name ON process_info(run_guid, name);";

const CREATE_RUNS: &str = "CREATE TABLE IF NOT EXISTS runs (
    run_guid TEXT PRIMARY KEY,
    fingerprint TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Run all pending migrations.
///
/// Run history is ephemeral, so an incompatible `process_info` shape from a
/// different program version is healed by dropping and recreating the table
/// rather than refusing to open.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_PROCESS_INFO)?;
    conn.execute_batch(CREATE_RUNS)?;

    if !schema_matches(conn, "process_info", PROCESS_INFO_COLUMNS)? {
        warn!("process_info table has an incompatible schema, recreating it");
        conn.execute_batch("DROP TABLE process_info;")?;
        conn.execute_batch(CREATE_PROCESS_INFO)?;
    }

    Ok(())
}

/// Compare a table's actual column names against the expected set.
fn schema_matches(conn: &Connection, table: &str, expected: &[&str]) -> Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns: Vec<String> = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(columns == expected)
}
