//! Gateway module - HTTP surface for the sandbox
//!
//! ```text
//! POST /execute   {"script": "..."}  ->  {"result", "stdout"} | {"error", "stdout"}
//! GET  /health                       ->  HealthReport
//! ```
//!
//! Orchestration failures map onto HTTP status codes; every error body
//! carries a machine-readable `kind`.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, warn};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::sandbox::Sandbox;

/// Error rendered as a JSON body
pub struct ApiError(Error);

impl ApiError {
    fn bad_request(message: &str) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message, "kind": "validation" })),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

/// HTTP status for an orchestration failure
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::ResourceExhausted(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Exhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Execution failed: {}", self.0);
        } else {
            warn!("Execution rejected: {}", self.0);
        }

        let mut body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        if let Error::Exhausted(failures) = &self.0 {
            body["failures"] = json!(failures);
        }
        (status, Json(body)).into_response()
    }
}

async fn execute(State(sandbox): State<Arc<Sandbox>>, body: Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return ApiError::bad_request("Request body must be a JSON object"),
    };
    let Some(script) = request.get("script").and_then(Value::as_str) else {
        return ApiError::bad_request("Field 'script' must be a string");
    };

    match sandbox.execute(script).await {
        Ok(execution) => (StatusCode::OK, Json(execution.outcome)).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn health(State(sandbox): State<Arc<Sandbox>>) -> Response {
    // PATH lookups and a scratch-file write in the work dir
    let report = match tokio::task::spawn_blocking(move || sandbox.health()).await {
        Ok(report) => report,
        Err(e) => {
            return ApiError::from(Error::Internal(format!("Health check failed: {}", e)))
                .into_response()
        }
    };
    let status = if report.available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Build the HTTP router
pub fn router(sandbox: Arc<Sandbox>, config: &ServerConfig) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .with_state(sandbox)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
}
