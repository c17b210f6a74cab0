//! Scoped connection handles.
//!
//! Every unit of work borrows a pooled connection through a [`ScopedHandle`].
//! The handle gives the connection back either through an explicit
//! [`ScopedHandle::release`] or, on any other exit path (early return, `?`,
//! panic, a dropped request future), through `Drop`. A handle is released at
//! most once; using it afterwards fails with [`JobError::HandleReleased`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::Pool;
use crate::error::{JobError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// One inbound request.
    Request,
    /// The long-lived handle used by periodic background work.
    Background,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeKind::Request => "request",
            ScopeKind::Background => "background",
        })
    }
}

#[derive(Debug, Default)]
struct ScopeCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    failed_acquisitions: AtomicU64,
}

/// Point-in-time view of the scope counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeStats {
    pub acquired: u64,
    pub released: u64,
    pub failed_acquisitions: u64,
}

impl ScopeStats {
    /// Handles currently checked out.
    pub fn active(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// A pooled connection bound to exactly one unit of work.
pub struct ScopedHandle {
    id: Uuid,
    kind: ScopeKind,
    conn: Option<PooledConnection<SqliteConnectionManager>>,
    counters: Arc<ScopeCounters>,
}

impl ScopedHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// The underlying connection, or `HandleReleased` once the scope ended.
    pub fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_deref()
            .ok_or(JobError::HandleReleased(self.id))
    }

    /// Return the connection to the pool.
    ///
    /// A transaction left open by the unit of work is rolled back first. If
    /// that rollback fails the connection is still returned and the error is
    /// reported to the caller; the scope counts as released either way.
    pub fn release(&mut self) -> Result<()> {
        let conn = self.conn.take().ok_or(JobError::HandleReleased(self.id))?;
        let rollback = if conn.is_autocommit() {
            Ok(())
        } else {
            warn!(scope_id = %self.id, kind = %self.kind, "Rolling back transaction left open by scope");
            conn.execute_batch("ROLLBACK")
        };
        drop(conn);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        debug!(scope_id = %self.id, kind = %self.kind, "Released connection scope");
        rollback.map_err(JobError::from)
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(e) = self.release() {
                error!(scope_id = %self.id, kind = %self.kind, error = %e, "Failed to release connection scope cleanly");
            }
        }
    }
}

impl fmt::Debug for ScopedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Hands out scoped handles over a shared, bounded pool.
///
/// Knows nothing about what the handles are used for.
#[derive(Clone)]
pub struct ConnectionManager {
    pool: Pool,
    counters: Arc<ScopeCounters>,
}

impl ConnectionManager {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            counters: Arc::new(ScopeCounters::default()),
        }
    }

    fn acquire(&self, kind: ScopeKind) -> Result<ScopedHandle> {
        // r2d2 waits at most `connection_timeout` for a free connection.
        let conn = self.pool.get().map_err(|e| {
            self.counters.failed_acquisitions.fetch_add(1, Ordering::SeqCst);
            warn!(kind = %kind, error = %e, "Connection acquisition failed");
            JobError::ConnectionUnavailable(e.to_string())
        })?;
        // A previous scope whose rollback failed returns its connection
        // mid-transaction. Never hand that state to a new unit of work.
        if !conn.is_autocommit() {
            warn!(kind = %kind, "Pooled connection still inside a transaction, rolling back");
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                self.counters.failed_acquisitions.fetch_add(1, Ordering::SeqCst);
                return Err(JobError::ConnectionUnavailable(format!(
                    "pooled connection stuck in a transaction: {e}"
                )));
            }
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let handle = ScopedHandle {
            id: Uuid::new_v4(),
            kind,
            conn: Some(conn),
            counters: Arc::clone(&self.counters),
        };
        debug!(scope_id = %handle.id, kind = %kind, "Acquired connection scope");
        Ok(handle)
    }

    /// Acquire a handle for one inbound request. Blocks up to the pool's
    /// acquisition timeout.
    pub fn acquire_request_scope(&self) -> Result<ScopedHandle> {
        self.acquire(ScopeKind::Request)
    }

    /// Async variant of [`acquire_request_scope`](Self::acquire_request_scope)
    /// that waits for the pool off the runtime's worker threads.
    pub async fn request_scope(&self) -> Result<ScopedHandle> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.acquire_request_scope())
            .await
            .map_err(|e| JobError::ConnectionUnavailable(format!("acquire task failed: {e}")))?
    }

    /// Run `work` inside a request scope and release the scope afterwards.
    ///
    /// The result of `work` is returned as-is; a failed release is logged
    /// and never replaces it.
    pub fn with_request_scope<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut ScopedHandle) -> Result<T>,
    {
        let mut handle = self.acquire_request_scope()?;
        let outcome = work(&mut handle);
        if let Err(e) = handle.release() {
            error!(scope_id = %handle.id(), error = %e, "Failed to release request scope");
        }
        outcome
    }

    /// Acquire the long-lived handle used by background work.
    ///
    /// Intended to be called once at startup; the returned scope holds one
    /// pool connection until [`BackgroundScope::close`] or drop.
    pub fn acquire_background_scope(&self) -> Result<BackgroundScope> {
        let handle = self.acquire(ScopeKind::Background)?;
        Ok(BackgroundScope {
            handle: tokio::sync::Mutex::new(handle),
        })
    }

    pub fn stats(&self) -> ScopeStats {
        ScopeStats {
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            failed_acquisitions: self.counters.failed_acquisitions.load(Ordering::SeqCst),
        }
    }
}

/// The background handle, serialized behind an async mutex so periodic
/// invocations can never use it concurrently.
#[derive(Debug)]
pub struct BackgroundScope {
    handle: tokio::sync::Mutex<ScopedHandle>,
}

impl BackgroundScope {
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ScopedHandle> {
        self.handle.lock().await
    }

    /// Tear the handle down. Later use of the handle fails with
    /// `HandleReleased`.
    pub async fn close(&self) -> Result<()> {
        self.handle.lock().await.release()
    }
}
