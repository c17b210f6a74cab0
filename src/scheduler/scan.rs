//! The periodic job scan: runs every registered job once per tick on the
//! background connection scope.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tracing::{debug, error, info};

use super::trigger::PeriodicTask;
use crate::jobs::{execute_job, JobExecutor, JobKind};
use crate::storage::BackgroundScope;

pub struct JobScan {
    scope: Arc<BackgroundScope>,
    executor: Arc<dyn JobExecutor>,
    jobs: Vec<String>,
}

impl JobScan {
    pub fn new(scope: Arc<BackgroundScope>, executor: Arc<dyn JobExecutor>, jobs: Vec<String>) -> Self {
        Self {
            scope,
            executor,
            jobs,
        }
    }
}

#[async_trait]
impl PeriodicTask for JobScan {
    fn name(&self) -> &str {
        "job-scan"
    }

    /// Runs each job in turn. A job that ends `failed` is a normal outcome;
    /// only storage-level errors count against the scan, and they do not
    /// stop the remaining jobs.
    async fn run(&self) -> anyhow::Result<()> {
        if self.jobs.is_empty() {
            debug!("No scheduled jobs registered");
            return Ok(());
        }

        let mut handle = self.scope.lock().await;
        let mut errors = 0usize;
        for job_name in &self.jobs {
            match execute_job(&mut handle, self.executor.as_ref(), job_name, JobKind::Run).await {
                Ok(run) => info!(run_id = run.id, %job_name, status = %run.status, "Scheduled job finished"),
                Err(e) => {
                    errors += 1;
                    error!(%job_name, error = %e, "Scheduled job could not be tracked");
                }
            }
        }

        if errors > 0 {
            bail!("{errors} of {} scheduled jobs could not be tracked", self.jobs.len());
        }
        Ok(())
    }
}
