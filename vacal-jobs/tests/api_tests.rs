//! HTTP API tests
//!
//! Jobs run in real `vacal-jobs worker` processes against a temporary data folder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use vacal_jobs::config::ServiceConfig;
use vacal_jobs::services::{JobLauncher, JobService, WorkerContext};
use vacal_jobs::AppState;

async fn create_test_app(dir: &TempDir) -> Router {
    let mut config = ServiceConfig::for_data_dir(dir.path());
    std::fs::create_dir_all(&config.jobs_dir).unwrap();
    config.worker_program = Some(PathBuf::from(env!("CARGO_BIN_EXE_vacal-jobs")));
    config.log_poll_interval = Duration::from_millis(100);

    let pool = vacal_jobs::db::init_database_pool(&config.database_path).await.unwrap();
    let worker = WorkerContext::from_config(pool.clone(), Arc::new(config)).unwrap();
    let service = JobService::new(pool, JobLauncher::new(worker));
    vacal_jobs::build_router(AppState::new(service))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn pipeline_request() -> Value {
    json!({
        "type": "pipeline",
        "algorithms": ["InterVA", "InSilicoVA"],
        "age_group": "neonate",
        "country": "Mozambique",
        "ensemble": true,
        "mcmc": { "n_mcmc": 600, "n_burn": 200, "n_thin": 1, "seed": 11 }
    })
}

async fn wait_terminal(app: &Router, job_id: &str) -> Value {
    for _ in 0..600 {
        let (status, body) = send(app, "GET", &format!("/jobs/{}/status", job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" || body["status"] == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {} did not finish", job_id);
}

#[tokio::test]
async fn health_reports_module() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "vacal-jobs");
    assert_eq!(body["jobs"]["pending"], 0);
    assert_eq!(body["jobs"]["completed"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_returns_before_job_finishes() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;

    let (status, body) = send(&app, "POST", "/jobs", Some(pipeline_request())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/jobs/{}/status", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["status"] == "pending" || body["status"] == "running", "{}", body);
    assert!(body["completed_at"].is_null());

    wait_terminal(&app, &job_id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ensemble_pipeline_produces_three_calibrated_rows() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;

    let (_, body) = send(&app, "POST", "/jobs", Some(pipeline_request())).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let final_status = wait_terminal(&app, &job_id).await;
    assert_eq!(final_status["status"], "completed", "{}", final_status);
    assert!(final_status.get("error").is_none());

    let (status, body) = send(&app, "GET", &format!("/jobs/{}/results", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let result = &body["result"];
    assert_eq!(result["ensemble"], true);

    let rows = result["calibrated_csmf"].as_array().unwrap();
    let labels: Vec<&str> = rows.iter().map(|r| r["label"].as_str().unwrap()).collect();
    assert_eq!(labels, vec!["InterVA", "InSilicoVA", "ensemble"]);
    for row in rows {
        let sum: f64 = row["mean"].as_array().unwrap().iter().map(|v| v.as_f64().unwrap()).sum();
        assert!((sum - 1.0).abs() <= 0.02, "mean sums to {}", sum);
    }
    assert_eq!(result["uncalibrated_csmf"].as_array().unwrap().len(), 3);

    let (status, log) = send(&app, "GET", &format!("/jobs/{}/log", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let lines: Vec<&str> = log["lines"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["text"].as_str().unwrap())
        .collect();
    assert!(lines.iter().any(|l| l.starts_with("InterVA: classifying")));
    assert!(lines.iter().any(|l| *l == "Job completed"));

    let files = result["files"].as_array().unwrap();
    assert!(files.iter().any(|f| f["name"] == "misclassification_InterVA.csv"));
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{}/files/calibrated_csmf.csv", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.starts_with(b"label,cause"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rerun_creates_new_pending_job() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;

    let mut request = pipeline_request();
    request["algorithms"] = json!(["EAVA"]);
    request["ensemble"] = json!(false);
    let (_, body) = send(&app, "POST", "/jobs/demo", Some(request)).await;
    let original = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(wait_terminal(&app, &original).await["status"], "completed");

    let (status, body) = send(&app, "POST", &format!("/jobs/{}/rerun", original), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let rerun = body["job_id"].as_str().unwrap().to_string();
    assert_ne!(rerun, original);

    let (_, status_body) = send(&app, "GET", &format!("/jobs/{}/status", rerun), None).await;
    assert_eq!(status_body["rerun_of"], original.as_str());

    let (_, list) = send(&app, "GET", "/jobs", None).await;
    assert_eq!(list["jobs"].as_array().unwrap().len(), 2);

    assert_eq!(wait_terminal(&app, &rerun).await["status"], "completed");
}

#[tokio::test]
async fn ensemble_with_one_algorithm_is_rejected() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;

    let mut request = pipeline_request();
    request["algorithms"] = json!(["InterVA"]);
    let (status, body) = send(&app, "POST", "/jobs", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (_, list) = send(&app, "GET", "/jobs", None).await;
    assert!(list["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_identifiers_are_rejected() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;

    for (field, value) in [("type", json!("batch")), ("algorithms", json!(["Tariff"]))] {
        let mut request = pipeline_request();
        request[field] = value;
        let (status, _) = send(&app, "POST", "/jobs", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn unknown_job_is_404() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;
    let id = uuid::Uuid::new_v4();

    for uri in [
        format!("/jobs/{}/status", id),
        format!("/jobs/{}/log", id),
        format!("/jobs/{}/results", id),
        format!("/jobs/{}/files/calibrated_csmf.csv", id),
    ] {
        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn results_of_unfinished_job_are_not_ready() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(&dir).await;

    let mut request = pipeline_request();
    request["mcmc"] = json!({ "n_mcmc": 4000, "n_burn": 1000, "n_thin": 1, "seed": 2 });
    let (_, body) = send(&app, "POST", "/jobs", Some(request)).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/jobs/{}/results", job_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["ready"], false);
    assert!(body["status"] == "pending" || body["status"] == "running");

    wait_terminal(&app, &job_id).await;
}
