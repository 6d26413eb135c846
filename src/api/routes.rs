//! API route definitions.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::{ok, ApiError};
use crate::orchestrator::status::TestState;

/// Upper bound for an uploaded developer-defined test archive.
const MAX_ARCHIVE_BYTES: usize = 64 * 1024 * 1024;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tests/new", post(new_test))
        .route("/tests/test-status", get(test_status).post(update_test_status))
        .route("/tests/test-report", get(test_report))
        .route("/tests/publish-test-results", post(publish_test_results))
        .route("/tests/download-developer-defined", get(download_developer_defined))
        .route("/tests/per-testbed", get(tests_per_testbed))
        .route(
            "/tests/developer-defined/{netapp_id}/{name}",
            put(upload_developer_defined).layer(DefaultBodyLimit::max(MAX_ARCHIVE_BYTES)),
        )
}

async fn health() -> Json<Value> {
    Json(json!({
        "message": "",
        "success": true,
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
        "errors": [],
    }))
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Body: the testing descriptor as YAML (or JSON).
async fn new_test(State(state): State<AppState>, body: String) -> Result<Response, ApiError> {
    let receipt = state.orchestrator.submit(&body).await?;
    Ok(ok("A new build job was created", json!(receipt)))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunQuery {
    run_id: i64,
}

async fn test_status(
    State(state): State<AppState>,
    Query(q): Query<RunQuery>,
) -> Result<Response, ApiError> {
    let log = state.orchestrator.status_log(q.run_id)?;
    Ok(ok("", json!(log)))
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    test_id: i64,
    access_token: String,
}

async fn test_report(
    State(state): State<AppState>,
    Query(q): Query<ReportQuery>,
) -> Result<Response, ApiError> {
    let report = state.orchestrator.report(q.test_id, &q.access_token)?;
    Ok(ok("", json!(report)))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    communication_token: String,
    test_id: i64,
    success: bool,
    state: String,
}

async fn update_test_status(
    State(state): State<AppState>,
    Json(update): Json<StatusUpdate>,
) -> Result<Response, ApiError> {
    let test_state: TestState = match update.state.parse() {
        Ok(s) => s,
        Err(e) => return Ok(ApiError::bad_request(format!("{e}"))),
    };
    let entry = state.orchestrator.record_agent_status(
        update.test_id,
        &update.communication_token,
        test_state,
        update.success,
    )?;
    Ok(ok("", json!(entry)))
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PublishResults {
    communication_token: String,
    test_id: i64,
    ftp_results_directory: String,
}

async fn publish_test_results(
    State(state): State<AppState>,
    Json(req): Json<PublishResults>,
) -> Result<Response, ApiError> {
    let tests = state
        .orchestrator
        .publish_results(req.test_id, &req.communication_token, &req.ftp_results_directory)
        .await?;
    Ok(ok("", json!(tests)))
}

// ---------------------------------------------------------------------------
// Developer-defined tests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeveloperDefinedDownload {
    communication_token: String,
    test_instance_id: i64,
    developer_defined_test_name: String,
}

async fn download_developer_defined(
    State(state): State<AppState>,
    Json(req): Json<DeveloperDefinedDownload>,
) -> Result<Response, ApiError> {
    let archive = state
        .orchestrator
        .developer_defined_test(
            req.test_instance_id,
            &req.communication_token,
            &req.developer_defined_test_name,
        )
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/tar+gzip")],
        archive,
    )
        .into_response())
}

async fn upload_developer_defined(
    State(state): State<AppState>,
    Path((netapp_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Ok(ApiError::bad_request("empty archive"));
    }
    let path = state
        .orchestrator
        .upload_developer_defined(&netapp_id, &name, &body)
        .await?;
    Ok(ok("Stored developer-defined test", json!({ "path": path })))
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TestbedQuery {
    testbed: String,
}

async fn tests_per_testbed(
    State(state): State<AppState>,
    Query(q): Query<TestbedQuery>,
) -> Result<Response, ApiError> {
    let tests = state.orchestrator.testbed_tests(&q.testbed)?;
    Ok(ok("", json!(tests)))
}
