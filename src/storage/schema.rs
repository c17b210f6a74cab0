//! Database schema and migrations.

use anyhow::Result;
use rusqlite::{params, Connection};

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS job_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name TEXT NOT NULL CHECK (length(job_name) > 0),
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'running', 'success', 'failed')),
            start_ts TEXT NOT NULL,
            update_ts TEXT NOT NULL,
            end_ts TEXT,
            CHECK ((end_ts IS NULL) = (status IN ('pending', 'running')))
        );

        CREATE INDEX IF NOT EXISTS idx_job_runs_name ON job_runs(job_name, start_ts);
        CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs(status);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}
