//! The execution side of a job: what actually happens while a run is
//! `running`.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// Which endpoint or trigger asked for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Run,
    Train,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Run => "run",
            JobKind::Train => "train",
        })
    }
}

/// Everything an executor is told about a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub run_id: i64,
    pub job_name: String,
    pub kind: JobKind,
}

/// Performs the work behind a job run.
///
/// Implementations define job semantics; the tracker only records the
/// outcome.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Check the job can start at all. An error here fails the run straight
    /// from `pending`.
    fn prepare(&self, _job: &JobRequest) -> Result<()> {
        Ok(())
    }

    /// Do the work. An error (or panic) fails the run from `running`.
    async fn execute(&self, job: &JobRequest) -> Result<()>;
}

/// Executor that only logs. Used until real job definitions are plugged in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl JobExecutor for LoggingExecutor {
    async fn execute(&self, job: &JobRequest) -> Result<()> {
        match job.kind {
            JobKind::Run => info!(run_id = job.run_id, job_name = %job.job_name, "Running job"),
            JobKind::Train => info!(run_id = job.run_id, job_name = %job.job_name, "Training job"),
        }
        Ok(())
    }
}
