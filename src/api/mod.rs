//! API layer -- axum routes, handlers, and middleware.
//!
//! Every response uses the envelope `{message, success, data, errors}`.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::orchestrator::status::StatusError;
use crate::orchestrator::OrchestrationError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> Response {
    envelope(StatusCode::NOT_FOUND, "not found", Value::Null, vec![])
}

pub(crate) fn envelope(status: StatusCode, message: &str, data: Value, errors: Vec<String>) -> Response {
    let body = json!({
        "message": message,
        "success": status.is_success(),
        "data": data,
        "errors": errors,
    });
    (status, Json(body)).into_response()
}

pub(crate) fn ok(message: &str, data: Value) -> Response {
    envelope(StatusCode::OK, message, data, vec![])
}

/// Orchestration failures mapped onto HTTP.
pub(crate) struct ApiError(pub OrchestrationError);

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Response {
        envelope(StatusCode::BAD_REQUEST, "", Value::Null, vec![message.into()])
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use OrchestrationError as E;

        let err = self.0;
        let (status, message, errors): (StatusCode, &str, Vec<String>) = match &err {
            E::Structural(list) => (
                StatusCode::BAD_REQUEST,
                "Error on validating the testing descriptor",
                list.iter().map(ToString::to_string).collect(),
            ),
            E::Semantic(list) => (
                StatusCode::BAD_REQUEST,
                "Error on validating test parameters",
                list.iter().map(ToString::to_string).collect(),
            ),
            E::MetricsContract => (
                StatusCode::BAD_REQUEST,
                "Badly defined parameters for the metrics collection process",
                vec![err.to_string()],
            ),
            E::TestbedNotFound(_)
            | E::InvalidTestName(_)
            | E::MissingDeveloperDefinedArtifact { .. }
            | E::NoAgentAvailable { .. }
            | E::Render(_) => (StatusCode::BAD_REQUEST, "", vec![err.to_string()]),
            E::Status(StatusError::UnknownRun(_)) | E::RunNotFound(_) => {
                (StatusCode::NOT_FOUND, "", vec![err.to_string()])
            }
            E::Status(StatusError::Storage(_)) | E::Storage(_) => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "", vec!["internal error".to_string()])
            }
            E::Status(_) => (StatusCode::CONFLICT, "", vec![err.to_string()]),
            E::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "", vec![err.to_string()]),
            E::CredentialProvisioning(_) | E::PipelineSubmission(_) | E::LogRetrieval(_) => {
                (StatusCode::BAD_GATEWAY, "", vec![err.to_string()])
            }
        };
        envelope(status, message, Value::Null, errors)
    }
}
