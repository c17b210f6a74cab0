//! HTTP tests: drive the router in-process and check bodies, status codes
//! and what ends up in `job_runs`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use jobrun::api::{self, state::AppState};
use jobrun::config::{DatabaseConfig, Settings};
use jobrun::jobs::{JobExecutor, JobKind, JobRequest, JobStatus, LoggingExecutor};
use jobrun::storage::{job_runs, open_pool, ConnectionManager};
use serde_json::{json, Value};
use tower::util::ServiceExt;

struct TestApp {
    router: axum::Router,
    connections: ConnectionManager,
    _dir: tempfile::TempDir,
}

fn test_app_with(executor: Arc<dyn JobExecutor>, pool_size: u32, timeout_ms: u64) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.database = DatabaseConfig {
        path: Some(dir.path().join("api.db")),
        pool_size,
        acquire_timeout_ms: timeout_ms,
        ..DatabaseConfig::default()
    };
    let connections = ConnectionManager::new(open_pool(&settings.database).unwrap());
    let state = AppState {
        connections: connections.clone(),
        executor,
        settings: Arc::new(settings),
    };
    TestApp {
        router: api::router(state),
        connections,
        _dir: dir,
    }
}

fn test_app() -> TestApp {
    test_app_with(Arc::new(LoggingExecutor), 4, 2_000)
}

async fn post(app: &TestApp, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, req).await
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.router.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

/// Remembers which status the run had while the executor was working.
struct Recording {
    connections: Mutex<Option<ConnectionManager>>,
    seen: Mutex<Vec<(JobKind, JobStatus)>>,
}

#[async_trait]
impl JobExecutor for Recording {
    async fn execute(&self, job: &JobRequest) -> anyhow::Result<()> {
        let connections = self.connections.lock().unwrap().clone().unwrap();
        let run = connections.with_request_scope(|h| job_runs::get(h, job.run_id))?;
        self.seen.lock().unwrap().push((job.kind, run.status));
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl JobExecutor for AlwaysFails {
    async fn execute(&self, job: &JobRequest) -> anyhow::Result<()> {
        anyhow::bail!("{} exploded", job.job_name)
    }
}

struct Hanging;

#[async_trait]
impl JobExecutor for Hanging {
    async fn execute(&self, _job: &JobRequest) -> anyhow::Result<()> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn health_ping() {
    let app = test_app();
    let req = Request::builder()
        .uri("/v1/health/ping")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["path"], "/v1/health/ping");
    assert!(body["utc"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn run_job_goes_pending_running_success() {
    let recording = Arc::new(Recording {
        connections: Mutex::new(None),
        seen: Mutex::new(Vec::new()),
    });
    let app = test_app_with(recording.clone(), 4, 2_000);
    *recording.connections.lock().unwrap() = Some(app.connections.clone());

    let (status, body) = post(&app, "/v1/run/job", json!({ "job_name": "etl-1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "job_status": "success" }));
    assert_eq!(
        *recording.seen.lock().unwrap(),
        vec![(JobKind::Run, JobStatus::Running)]
    );

    let latest = app
        .connections
        .with_request_scope(|h| job_runs::find_latest(h, "etl-1"))
        .unwrap()
        .unwrap();
    assert_eq!(latest.status, JobStatus::Success);
    assert!(latest.end_ts.unwrap() >= latest.start_ts);
    assert_eq!(app.connections.stats().active(), 0);
}

#[tokio::test]
async fn run_job_with_empty_name_fails() {
    let app = test_app();
    let (status, body) = post(&app, "/v1/run/job", json!({ "job_name": "" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "job_status": "failed" }));
    assert_eq!(app.connections.stats().active(), 0);
}

#[tokio::test]
async fn run_job_defaults_name() {
    let app = test_app();
    let (status, body) = post(&app, "/v1/run/job", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_status"], "success");
    let latest = app
        .connections
        .with_request_scope(|h| job_runs::find_latest(h, "test"))
        .unwrap();
    assert!(latest.is_some());
}

#[tokio::test]
async fn train_job_uses_train_kind() {
    let recording = Arc::new(Recording {
        connections: Mutex::new(None),
        seen: Mutex::new(Vec::new()),
    });
    let app = test_app_with(recording.clone(), 4, 2_000);
    *recording.connections.lock().unwrap() = Some(app.connections.clone());

    let (status, body) = post(&app, "/v1/train/job", json!({ "job_name": "model-a" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_status"], "success");
    assert_eq!(
        *recording.seen.lock().unwrap(),
        vec![(JobKind::Train, JobStatus::Running)]
    );
}

#[tokio::test]
async fn failing_job_reports_failed_and_records_it() {
    let app = test_app_with(Arc::new(AlwaysFails), 4, 2_000);
    let (status, body) = post(&app, "/v1/run/job", json!({ "job_name": "etl-1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_status"], "failed");

    let (_, body) = post(&app, "/v1/status/job", json!({ "job_name": "etl-1" })).await;
    assert_eq!(body["job_status"], "failed");
}

#[tokio::test]
async fn status_reflects_latest_run() {
    let app = test_app();
    post(&app, "/v1/run/job", json!({ "job_name": "etl-1" })).await;

    let (status, body) = post(&app, "/v1/status/job", json!({ "job_name": "etl-1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "job_status": "success" }));
}

#[tokio::test]
async fn status_of_unknown_job_is_not_found() {
    let app = test_app();
    let (status, body) = post(&app, "/v1/status/job", json!({ "job_name": "unknown-job" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "job_status": "not_found" }));
}

#[tokio::test]
async fn status_requires_job_name() {
    let app = test_app();
    let (status, body) = post(&app, "/v1/status/job", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["job_status"], "failed");

    let (status, body) = post(&app, "/v1/status/job", json!({ "job_name": " " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["job_status"], "failed");
}

#[tokio::test]
async fn malformed_body_still_answers_with_job_status() {
    let app = test_app();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/run/job")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["job_status"], "failed");
}

#[tokio::test]
async fn exhausted_pool_is_a_server_error() {
    let app = test_app_with(Arc::new(LoggingExecutor), 2, 100);
    let held: Vec<_> = (0..2)
        .map(|_| app.connections.acquire_request_scope().unwrap())
        .collect();

    let (status, body) = post(&app, "/v1/run/job", json!({ "job_name": "etl-1" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["job_status"], "failed");

    drop(held);
    let (status, _) = post(&app, "/v1/run/job", json!({ "job_name": "etl-1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.connections.stats().active(), 0);
}

#[tokio::test]
async fn dropped_request_fails_the_run() {
    let app = test_app_with(Arc::new(Hanging), 4, 2_000);
    let req = Request::builder()
        .method("POST")
        .uri("/v1/run/job")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "job_name": "etl-1" }).to_string()))
        .unwrap();
    let gone = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        app.router.clone().oneshot(req),
    )
    .await;
    assert!(gone.is_err(), "request should still be running");

    let (status, body) = post(&app, "/v1/status/job", json!({ "job_name": "etl-1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_status"], "failed");
    assert_eq!(app.connections.stats().active(), 0);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = test_app();
    let req = Request::builder()
        .uri("/v2/nothing")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_release_every_scope() {
    let app = Arc::new(test_app());
    let mut tasks = Vec::new();
    for i in 0..16 {
        let app = Arc::clone(&app);
        tasks.push(tokio::spawn(async move {
            let name = if i % 4 == 0 { String::new() } else { format!("job-{i}") };
            post(&app, "/v1/run/job", json!({ "job_name": name })).await
        }));
    }
    let mut ok = 0;
    for t in tasks {
        let (status, _) = t.await.unwrap();
        if status == StatusCode::OK {
            ok += 1;
        }
    }
    assert_eq!(ok, 12);

    let stats = app.connections.stats();
    assert_eq!(stats.acquired, 16);
    assert_eq!(stats.released, 16);
}
