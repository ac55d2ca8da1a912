use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use heartlink_shared::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

/// Probes the pairing store and the presence store.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let store = match state.matcher.store().ping().await {
        Ok(()) => HealthCheck::passed("store"),
        Err(e) => HealthCheck::failed("store", e.to_string()),
    };
    let presence = match state.presence.ping().await {
        Ok(()) => HealthCheck::passed("presence"),
        Err(e) => HealthCheck::failed("presence", e.to_string()),
    };

    let response = HealthResponse::healthy("heartlink-pairing", env!("CARGO_PKG_VERSION"))
        .with_checks(vec![store, presence]);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Prometheus exposition. Empty when no recorder is installed.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
