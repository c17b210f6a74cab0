//! API route definitions.
//!
//! Job endpoints always answer with a `job_status` body, whatever went
//! wrong; the HTTP status only says whose fault it was.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::state::AppState;
use crate::error::JobError;
use crate::jobs::{execute_job, JobKind, JobStatus};
use crate::storage::job_runs;

const PING_PATH: &str = "/v1/health/ping";

pub fn v1_routes() -> Router<AppState> {
    Router::new()
        .route("/health/ping", get(health_ping))
        .route("/run/job", post(run_job))
        .route("/train/job", post(train_job))
        .route("/status/job", post(job_status))
}

#[derive(Debug, Deserialize)]
pub struct JobRequestBody {
    #[serde(default = "default_job_name")]
    pub job_name: String,
}

fn default_job_name() -> String {
    "test".to_string()
}

#[derive(Debug, Deserialize)]
pub struct JobStatusRequest {
    pub job_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_status: String,
}

impl JobStatusResponse {
    pub const NOT_FOUND: &'static str = "not_found";

    fn status(status: JobStatus) -> Json<Self> {
        Json(Self {
            job_status: status.as_str().to_string(),
        })
    }

    fn failed() -> Json<Self> {
        Self::status(JobStatus::Failed)
    }

    fn not_found() -> Json<Self> {
        Json(Self {
            job_status: Self::NOT_FOUND.to_string(),
        })
    }
}

type JobResponse = (StatusCode, Json<JobStatusResponse>);

fn error_status(e: &JobError) -> StatusCode {
    if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn bad_body(rejection: JsonRejection) -> JobResponse {
    warn!(error = %rejection.body_text(), "Rejected job request body");
    (StatusCode::BAD_REQUEST, JobStatusResponse::failed())
}

async fn health_ping() -> Json<Value> {
    Json(json!({
        "status": "success",
        "path": PING_PATH,
        "utc": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn run_job(
    State(state): State<AppState>,
    body: Result<Json<JobRequestBody>, JsonRejection>,
) -> JobResponse {
    match body {
        Ok(Json(req)) => trigger_job(&state, &req.job_name, JobKind::Run).await,
        Err(rejection) => bad_body(rejection),
    }
}

async fn train_job(
    State(state): State<AppState>,
    body: Result<Json<JobRequestBody>, JsonRejection>,
) -> JobResponse {
    match body {
        Ok(Json(req)) => trigger_job(&state, &req.job_name, JobKind::Train).await,
        Err(rejection) => bad_body(rejection),
    }
}

/// Execute one job inside a request scope. The scope is released when this
/// future completes or is dropped.
async fn trigger_job(state: &AppState, job_name: &str, kind: JobKind) -> JobResponse {
    info!(%job_name, %kind, "Received job request");

    let outcome = async {
        let mut handle = state.connections.request_scope().await?;
        execute_job(&mut handle, state.executor.as_ref(), job_name, kind).await
    }
    .await;

    match outcome {
        Ok(run) => {
            info!(run_id = run.id, %job_name, %kind, status = %run.status, "Job request complete");
            (StatusCode::OK, JobStatusResponse::status(run.status))
        }
        Err(e) => {
            error!(%job_name, %kind, error = %e, "Job request failed");
            (error_status(&e), JobStatusResponse::failed())
        }
    }
}

async fn job_status(
    State(state): State<AppState>,
    body: Result<Json<JobStatusRequest>, JsonRejection>,
) -> JobResponse {
    let job_name = match body {
        Ok(Json(req)) => req.job_name,
        Err(rejection) => return bad_body(rejection),
    };
    info!(%job_name, "Checking job status");

    let latest = if job_name.trim().is_empty() {
        Err(JobError::InvalidJobName)
    } else {
        match state.connections.request_scope().await {
            Ok(handle) => job_runs::find_latest(&handle, &job_name),
            Err(e) => Err(e),
        }
    };

    match latest {
        Ok(Some(run)) => (StatusCode::OK, JobStatusResponse::status(run.status)),
        Ok(None) => {
            info!(%job_name, "No runs recorded for job");
            (StatusCode::NOT_FOUND, JobStatusResponse::not_found())
        }
        Err(e) => {
            error!(%job_name, error = %e, "Failed to get job status");
            (error_status(&e), JobStatusResponse::failed())
        }
    }
}
