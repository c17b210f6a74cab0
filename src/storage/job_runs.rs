//! Job run records.
//!
//! The only writer of `job_runs` rows. Every function works on a
//! [`ScopedHandle`] supplied by the caller, so the record store never
//! decides how long a connection lives.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};

use super::ScopedHandle;
use crate::error::{JobError, Result};
use crate::jobs::{JobRun, JobStatus};

const COLUMNS: &str = "id, job_name, status, start_ts, update_ts, end_ts";

/// Insert a new `pending` run for `job_name`.
pub fn create(handle: &ScopedHandle, job_name: &str) -> Result<JobRun> {
    if job_name.trim().is_empty() {
        return Err(JobError::InvalidJobName);
    }
    let conn = handle.conn()?;
    let now = now();
    let ts = format_ts(now);
    conn.execute(
        "INSERT INTO job_runs (job_name, status, start_ts, update_ts, end_ts)
         VALUES (?1, ?2, ?3, ?3, NULL)",
        params![job_name, JobStatus::Pending.as_str(), ts],
    )?;
    let run = JobRun {
        id: conn.last_insert_rowid(),
        job_name: job_name.to_string(),
        status: JobStatus::Pending,
        start_ts: now,
        update_ts: now,
        end_ts: None,
    };
    tracing::debug!(run_id = run.id, job_name = %run.job_name, "Created job run");
    Ok(run)
}

/// Move run `id` to `new_status`.
///
/// The read-check-write runs in one immediate transaction; a rejected
/// transition leaves the row untouched.
pub fn update_status(handle: &ScopedHandle, id: i64, new_status: JobStatus) -> Result<JobRun> {
    let conn = handle.conn()?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let current = select_by_id(&tx, id)?.ok_or(JobError::NotFound(id))?;
    if !current.status.can_transition_to(new_status) {
        // Dropping `tx` rolls back the (read-only) transaction.
        return Err(JobError::InvalidTransition {
            id,
            from: current.status,
            to: new_status,
        });
    }

    // Never let update_ts run backwards, even if the wall clock does.
    let ts = now().max(current.update_ts);
    let end_ts = new_status.is_terminal().then_some(ts);
    tx.execute(
        "UPDATE job_runs SET status = ?1, update_ts = ?2, end_ts = ?3 WHERE id = ?4",
        params![
            new_status.as_str(),
            format_ts(ts),
            end_ts.map(format_ts),
            id
        ],
    )?;
    tx.commit()?;

    Ok(JobRun {
        status: new_status,
        update_ts: ts,
        end_ts,
        ..current
    })
}

pub fn get(handle: &ScopedHandle, id: i64) -> Result<JobRun> {
    select_by_id(handle.conn()?, id)?.ok_or(JobError::NotFound(id))
}

/// The most recently started run of `job_name`, if any.
pub fn find_latest(handle: &ScopedHandle, job_name: &str) -> Result<Option<JobRun>> {
    let run = handle
        .conn()?
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM job_runs WHERE job_name = ?1
                 ORDER BY start_ts DESC, id DESC LIMIT 1"
            ),
            params![job_name],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}

/// Up to `limit` runs of `job_name`, newest first.
pub fn list_recent(handle: &ScopedHandle, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
    let conn = handle.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM job_runs WHERE job_name = ?1
         ORDER BY start_ts DESC, id DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![job_name, limit as i64], row_to_run)?;
    let mut runs = Vec::new();
    for r in rows {
        runs.push(r?);
    }
    Ok(runs)
}

fn select_by_id(conn: &rusqlite::Connection, id: i64) -> Result<Option<JobRun>> {
    let run = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM job_runs WHERE id = ?1"),
            params![id],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let end_ts: Option<String> = row.get(5)?;
    Ok(JobRun {
        id: row.get(0)?,
        job_name: row.get(1)?,
        status,
        start_ts: parse_ts(3, &row.get::<_, String>(3)?)?,
        update_ts: parse_ts(4, &row.get::<_, String>(4)?)?,
        end_ts: end_ts.map(|s| parse_ts(5, &s)).transpose()?,
    })
}

/// Current time at the precision stored in the database.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width UTC form, so lexical order in SQL equals time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
