//! Health check endpoints — for load balancers, monitoring, and Docker health checks.
//!
//! `/healthz` is a liveness probe (process is up, nothing more). `/readyz`
//! additionally checks the storage gateway can serve a read, so a restart
//! loop during database recovery shows as not-ready rather than healthy.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/healthz", get(liveness)).route("/readyz", get(readiness))
}

async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy".into(), version: env!("CARGO_PKG_VERSION").to_string() })
}

async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let ready = state.storage.db.read().is_ok();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = HealthResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    (status, Json(body))
}
