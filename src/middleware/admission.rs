//! Load-shedding admission control.
//!
//! A bounded-parallelism gate in front of the evaluation entry point. When
//! no permit is available the request is shed: only the minimal fields
//! needed for a degraded response are parsed, no backend is touched, and
//! the caller-supplied decision is preserved under `engine_mode=DEGRADED`
//! with an `X-Load-Shed: true` marker.

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::models::TransactionRequest;
use crate::service::ERR_LOAD_SHEDDING;
use crate::state::AppState;

/// Largest body the shed path will buffer while extracting
/// `transaction_id` and `decision`.
const SHED_BODY_LIMIT: usize = 64 * 1024;

pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Non-blocking acquire. The permit is released on drop, which covers
    /// both normal completion and unwinds.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }
}

/// Middleware guarding the evaluation route.
pub async fn admission_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(permit) = state.admission.try_acquire() else {
        return shed(state, request).await;
    };

    let response = next.run(request).await;
    drop(permit);
    response
}

/// Shed path: 200 with a degraded decision. Touches neither Redis nor the
/// outbox; the decision is not published.
async fn shed(state: AppState, request: Request<Body>) -> Response {
    warn!(
        max_concurrent = state.admission.max_concurrent(),
        "Load shedding evaluation request"
    );
    metrics::increment_counter!("load_shed_total");

    let (_parts, body) = request.into_parts();
    let request = match axum::body::to_bytes(body, SHED_BODY_LIMIT).await {
        Ok(bytes) => serde_json::from_slice::<TransactionRequest>(&bytes).unwrap_or_default(),
        Err(_) => TransactionRequest::default(),
    };

    let decision = state.service.degraded_decision(&request, ERR_LOAD_SHEDDING);

    (
        StatusCode::OK,
        [("X-Load-Shed", "true")],
        Json(decision),
    )
        .into_response()
}
