//! Drives one job run through `pending -> running -> success | failed`.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, info};

use super::{JobExecutor, JobKind, JobRequest, JobRun, JobStatus};
use crate::error::Result;
use crate::storage::{job_runs, ScopedHandle};

/// State machine for a single run. Every transition is persisted through
/// the record store before the in-memory copy changes.
#[derive(Debug, Clone)]
pub struct JobTracker {
    run: JobRun,
}

impl JobTracker {
    /// Record a new `pending` run.
    pub fn create(handle: &ScopedHandle, job_name: &str) -> Result<Self> {
        let run = job_runs::create(handle, job_name)?;
        info!(run_id = run.id, job_name = %run.job_name, "Job run pending");
        Ok(Self { run })
    }

    /// Pick up an existing run by id.
    pub fn resume(handle: &ScopedHandle, id: i64) -> Result<Self> {
        Ok(Self {
            run: job_runs::get(handle, id)?,
        })
    }

    pub fn run(&self) -> &JobRun {
        &self.run
    }

    pub fn id(&self) -> i64 {
        self.run.id
    }

    pub fn status(&self) -> JobStatus {
        self.run.status
    }

    pub fn start(&mut self, handle: &ScopedHandle) -> Result<&JobRun> {
        self.transition(handle, JobStatus::Running)
    }

    pub fn succeed(&mut self, handle: &ScopedHandle) -> Result<&JobRun> {
        self.transition(handle, JobStatus::Success)
    }

    /// Fail the run. `reason` is logged; it is not stored on the row.
    pub fn fail(&mut self, handle: &ScopedHandle, reason: &str) -> Result<&JobRun> {
        error!(
            run_id = self.run.id,
            job_name = %self.run.job_name,
            from = %self.run.status,
            %reason,
            "Job run failed"
        );
        self.transition(handle, JobStatus::Failed)
    }

    fn transition(&mut self, handle: &ScopedHandle, to: JobStatus) -> Result<&JobRun> {
        let from = self.run.status;
        self.run = job_runs::update_status(handle, self.run.id, to)?;
        info!(run_id = self.run.id, job_name = %self.run.job_name, %from, %to, "Job run transitioned");
        Ok(&self.run)
    }
}

/// Create a run for `job_name` and execute it to a terminal status.
///
/// Job failures end up in the returned run's status; only storage and
/// validation problems are returned as errors. The handle stays checked out
/// for the whole execution. If the returned future is dropped before the
/// run ends (client gone, task aborted), the run is failed on drop.
pub async fn execute_job(
    handle: &mut ScopedHandle,
    executor: &dyn JobExecutor,
    job_name: &str,
    kind: JobKind,
) -> Result<JobRun> {
    let tracker = JobTracker::create(handle, job_name)?;
    let mut live = LiveRun { handle, tracker };
    let request = JobRequest {
        run_id: live.tracker.id(),
        job_name: job_name.to_string(),
        kind,
    };

    if let Err(e) = executor.prepare(&request) {
        live.tracker.fail(live.handle, &format!("{e:#}"))?;
        return Ok(live.tracker.run().clone());
    }

    live.tracker.start(live.handle)?;
    let outcome = AssertUnwindSafe(executor.execute(&request))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            live.tracker.succeed(live.handle)?;
        }
        Ok(Err(e)) => {
            live.tracker.fail(live.handle, &format!("{e:#}"))?;
        }
        Err(panic) => {
            live.tracker.fail(
                live.handle,
                &format!("executor panicked: {}", panic_message(&*panic)),
            )?;
        }
    }
    Ok(live.tracker.run().clone())
}

/// A run between `create` and its terminal status. Dropping it while the
/// run is still live fails the run on the same handle, before the handle
/// itself goes back to the pool.
struct LiveRun<'h> {
    handle: &'h mut ScopedHandle,
    tracker: JobTracker,
}

impl Drop for LiveRun<'_> {
    fn drop(&mut self) {
        if self.tracker.status().is_terminal() {
            return;
        }
        let run_id = self.tracker.id();
        if let Err(e) = self.tracker.fail(self.handle, "cancelled before completion") {
            error!(run_id, error = %e, "Failed to close out cancelled job run");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
