//! SQLite storage layer -- pool, scoped connection handles, schema, and the
//! job run record store.

pub mod connection;
pub mod job_runs;
pub mod schema;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::DatabaseConfig;

pub use self::connection::{BackgroundScope, ConnectionManager, ScopeStats, ScopedHandle};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Where a `sqlite://` URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    Memory,
    File(String),
}

/// Parse a database URI into a SQLite target.
///
/// Only the `sqlite` driver can be opened; other drivers are reported
/// rather than silently replaced.
pub fn parse_uri(uri: &str) -> Result<SqliteTarget> {
    match uri.strip_prefix("sqlite://") {
        Some("") | Some(":memory:") => Ok(SqliteTarget::Memory),
        Some(path) => Ok(SqliteTarget::File(path.to_string())),
        None => {
            let driver = uri.split("://").next().unwrap_or(uri);
            bail!("unsupported database driver '{driver}': only sqlite is available")
        }
    }
}

/// Open (or create) the database described by `db` and return a connection pool.
pub fn open_pool(db: &DatabaseConfig) -> Result<Pool> {
    let target = parse_uri(&db.uri())?;
    // r2d2 asserts on both of these instead of returning an error.
    if db.pool_size == 0 || db.acquire_timeout_ms == 0 {
        bail!(
            "pool_size ({}) and acquire_timeout_ms ({}) must be greater than zero",
            db.pool_size,
            db.acquire_timeout_ms
        );
    }

    let manager = match &target {
        // Pooled connections to plain ":memory:" would each get a private
        // database; a named shared-cache database is visible to all of them.
        SqliteTarget::Memory => SqliteConnectionManager::file(format!(
            "file:jobrun-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        ))
        .with_init(|c| {
            c.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        }),
        SqliteTarget::File(path) => SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        }),
    };

    let pool = R2D2Pool::builder()
        .max_size(db.pool_size)
        .connection_timeout(Duration::from_millis(db.acquire_timeout_ms))
        .build(manager)
        .with_context(|| format!("failed to open database {target:?}"))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    tracing::info!(database = ?target, pool_size = db.pool_size, "Database ready");

    Ok(pool)
}
