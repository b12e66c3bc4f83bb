//! HTTP surface: the evaluation entry point plus registry administration
//! and probes, all versioned under `/v1/`.

pub mod evaluate;
pub mod rulesets;

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::middleware::{admission_guard, request_logging};
use crate::state::AppState;

/// Build the full application router. The admission gate wraps only the
/// evaluation route; probes and admin endpoints stay reachable under load.
pub fn router(state: AppState) -> Router {
    let evaluation = Router::new()
        .route("/v1/evaluate/monitoring", post(evaluate::evaluate_monitoring))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            admission_guard,
        ));

    let admin = Router::new()
        .route("/v1/evaluate/health", get(evaluate::health))
        .route("/v1/evaluate/ready", get(evaluate::ready))
        .route("/metrics", get(evaluate::metrics))
        .route(
            "/v1/evaluate/rulesets/registry/status",
            get(rulesets::registry_status),
        )
        .route(
            "/v1/evaluate/rulesets/registry/:country",
            get(rulesets::registry_country),
        )
        .route("/v1/evaluate/rulesets/hotswap", post(rulesets::hotswap))
        .route("/v1/evaluate/rulesets/load", post(rulesets::load))
        .route("/v1/evaluate/rulesets/bulk-load", post(rulesets::bulk_load));

    Router::new()
        .merge(evaluation)
        .merge(admin)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging))
        .with_state(state)
}
