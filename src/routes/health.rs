use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_batches: usize,
}

/// GET /health: liveness plus the number of batches still running or paused.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_batches = state.batches.active_count();
    metrics::gauge!("batch_registry_active").set(active_batches as f64);

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_batches,
    })
}
