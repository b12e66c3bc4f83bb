//! Ruleset registry administration endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::registry::GLOBAL_COUNTRY;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SwapRequest {
    #[serde(default)]
    pub country: Option<String>,
    pub key: String,
    pub version: i64,
}

impl SwapRequest {
    fn country(&self) -> &str {
        self.country.as_deref().unwrap_or(GLOBAL_COUNTRY)
    }

    fn validate(&self) -> Result<(), Response> {
        if self.key.trim().is_empty() {
            return Err(invalid("key must not be empty"));
        }
        if self.version <= 0 {
            return Err(invalid("version must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkLoadRequest {
    pub rulesets: Vec<SwapRequest>,
}

#[derive(Debug, Serialize)]
struct SwapResponse {
    success: bool,
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_version: Option<i64>,
}

fn invalid(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"code": "INVALID_REQUEST", "message": message})),
    )
        .into_response()
}

/// `GET /v1/evaluate/rulesets/registry/status`
pub async fn registry_status(State(state): State<AppState>) -> Response {
    let storage_accessible = state.loader.is_storage_accessible().await;
    Json(json!({
        "total_rulesets": state.registry.size(),
        "countries": state.registry.countries(),
        "storage_accessible": storage_accessible,
    }))
    .into_response()
}

/// `GET /v1/evaluate/rulesets/registry/{country}`
pub async fn registry_country(
    State(state): State<AppState>,
    Path(country): Path<String>,
) -> Response {
    Json(json!({
        "country": country,
        "keys": state.registry.keys(&country),
    }))
    .into_response()
}

/// `POST /v1/evaluate/rulesets/hotswap`
pub async fn hotswap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> Response {
    if let Err(response) = request.validate() {
        return response;
    }

    let result = state
        .registry
        .hot_swap(request.country(), &request.key, request.version)
        .await;

    Json(SwapResponse {
        success: result.success,
        status: result.status.as_str(),
        message: result.message,
        old_version: result.old_version,
        new_version: result.new_version,
    })
    .into_response()
}

/// `POST /v1/evaluate/rulesets/load` — accepts a first install.
pub async fn load(State(state): State<AppState>, Json(request): Json<SwapRequest>) -> Response {
    if let Err(response) = request.validate() {
        return response;
    }

    let success = state
        .registry
        .load_and_register(request.country(), &request.key, request.version)
        .await;

    Json(json!({
        "success": success,
        "country": request.country(),
        "key": request.key,
        "version": request.version,
    }))
    .into_response()
}

/// `POST /v1/evaluate/rulesets/bulk-load` — failures are logged and do not
/// abort the batch.
pub async fn bulk_load(
    State(state): State<AppState>,
    Json(request): Json<BulkLoadRequest>,
) -> Response {
    let entries: Vec<(String, String, i64)> = request
        .rulesets
        .iter()
        .filter(|r| !r.key.trim().is_empty() && r.version > 0)
        .map(|r| (r.country().to_string(), r.key.clone(), r.version))
        .collect();

    let loaded = state.registry.bulk_load(&entries).await;

    Json(json!({
        "requested": request.rulesets.len(),
        "loaded": loaded,
    }))
    .into_response()
}
