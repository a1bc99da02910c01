use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics: Prometheus text exposition of batch and prediction metrics.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

/// Register descriptions for every metric the batch core records.
pub fn describe() {
    metrics::describe_counter!("batch_jobs_started_total", "Batches that entered Running");
    metrics::describe_counter!("batch_jobs_completed_total", "Batches that reached Completed");
    metrics::describe_counter!("batch_jobs_canceled_total", "Batches canceled by an operator or on shutdown");
    metrics::describe_counter!("batch_items_succeeded_total", "Scans with a recorded prediction");
    metrics::describe_counter!("batch_items_failed_total", "Scans that exhausted their attempts or failed permanently");
    metrics::describe_counter!("batch_item_retries_total", "Failed attempts that were re-queued");
    metrics::describe_histogram!("prediction_call_seconds", "Duration of a single prediction call");
    metrics::describe_gauge!("batch_jobs_active", "Batch runs currently in progress");
    metrics::describe_gauge!("batch_registry_active", "Running or paused batches at last health check");
}
