//! Health, queue status, and metrics endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health` — liveness probe. No authentication, suitable for
/// load-balancer checks.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// `GET /status` — current queue depth and slot occupancy, polled by the
/// landing page.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.coordinator.status().await;
    Json(json!({
        "queue_size": snapshot.queue_size,
        "session_active": snapshot.session_active,
        "estimated_wait": snapshot.estimated_wait,
        "max_queue_size": state.config.session.max_queue_size,
    }))
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}
