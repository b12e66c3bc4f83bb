//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.
//! Health, readiness, and metrics probes are skipped to reduce noise.

use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};

const QUIET_PATHS: &[&str] = &["/v1/evaluate/health", "/v1/evaluate/ready", "/metrics"];

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if QUIET_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    let load_shed = response.headers().contains_key("X-Load-Shed");

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency.as_millis() as u64,
            "Request failed (5xx)"
        );
    } else if load_shed {
        info!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency.as_millis() as u64,
            load_shed = true,
            "Request shed"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency.as_millis() as u64,
            "Request completed"
        );
    }

    response
}
