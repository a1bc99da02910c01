use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod batches;
pub mod error;
pub mod health;
pub mod metrics;

/// Batch control API and health check.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/batches", post(batches::create_batch))
        .route(
            "/api/v1/batches/{id}",
            get(batches::get_batch).delete(batches::delete_batch),
        )
        .route("/api/v1/batches/{id}/pause", post(batches::pause_batch))
        .route("/api/v1/batches/{id}/resume", post(batches::resume_batch))
        .route("/api/v1/batches/{id}/cancel", post(batches::cancel_batch))
        .route("/api/v1/batches/{id}/export", get(batches::export_batch))
        .route("/api/v1/batches/{id}/events", get(batches::batch_events))
        .with_state(state)
}
