//! Evaluation entry point and service probes.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::models::TransactionRequest;
use crate::service::ERR_INVALID_REQUEST;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            code: ERR_INVALID_REQUEST,
            message: message.into(),
        }),
    )
        .into_response()
}

/// `POST /v1/evaluate/monitoring`
///
/// Normalize, select a ruleset with country fallback, evaluate all-match,
/// publish asynchronously, respond 200. Only input validation produces a
/// 400; every internal fault fails open into a degraded 200.
pub async fn evaluate_monitoring(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<TransactionRequest>(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Unparseable evaluation request");
            return bad_request("body must be a JSON transaction object");
        }
    };

    match state.service.evaluate_monitoring(&request).await {
        // Invalid caller decision: 400, no side effects, nothing published.
        Err(invalid) => bad_request(invalid.message),
        Ok(decision) => {
            state.publish.enqueue(decision.clone());
            (StatusCode::OK, Json(decision)).into_response()
        }
    }
}

/// `GET /v1/evaluate/health`
pub async fn health(State(state): State<AppState>) -> Response {
    let storage_accessible = state.loader.is_storage_accessible().await;
    let status = if state.is_ready() { "UP" } else { "DOWN" };
    Json(json!({
        "status": status,
        "storage_accessible": storage_accessible,
    }))
    .into_response()
}

/// `GET /v1/evaluate/ready` — flips to 503 once shutdown begins.
pub async fn ready(State(state): State<AppState>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ready": false})),
        )
            .into_response()
    }
}

/// `GET /metrics` — Prometheus exposition when a recorder is installed.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
