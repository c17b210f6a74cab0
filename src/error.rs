use thiserror::Error;

use crate::jobs::JobStatus;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("storage connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("connection handle {0} was already released")]
    HandleReleased(uuid::Uuid),

    #[error("job name must not be empty")]
    InvalidJobName,

    #[error("job run {0} not found")]
    NotFound(i64),

    #[error("invalid transition for job run {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl JobError {
    /// Errors caused by the caller's input rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, JobError::InvalidJobName)
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
