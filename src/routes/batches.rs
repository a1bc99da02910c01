use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use garde::Validate;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{BatchCreatedResponse, ControlResponse, CreateBatchRequest, ExportQuery};
use crate::models::batch::{BatchJob, ControlOp};
use crate::models::progress::ProgressEvent;
use crate::routes::error::ApiError;
use crate::services::export;
use crate::services::orchestrator::BatchHandle;

const CREATED_BY_HEADER: HeaderName = HeaderName::from_static("x-batch-created-by");
const BATCH_ID_HEADER: HeaderName = HeaderName::from_static("x-batch-id");

/// POST /api/v1/batches: snapshot a selection of scans and start processing it.
pub async fn create_batch(
    State(state): State<AppState>,
    Json(request): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<BatchCreatedResponse>), ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let job = BatchJob::new(request.scan_ids, request.created_by)?;
    let items_total = job.items.len();
    let handle = state.batches.submit(job);

    tracing::info!(job_id = %handle.id(), items_total, "Batch submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchCreatedResponse {
            batch_id: handle.id(),
            run_state: handle.run_state(),
            items_total,
        }),
    ))
}

/// GET /api/v1/batches/{id}: point-in-time snapshot of a batch.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchJob>, ApiError> {
    Ok(Json(lookup(&state, id)?.snapshot()))
}

pub async fn pause_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ApiError> {
    control(&state, id, ControlOp::Pause)
}

pub async fn resume_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ApiError> {
    control(&state, id, ControlOp::Resume)
}

pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ApiError> {
    control(&state, id, ControlOp::Cancel)
}

/// GET /api/v1/batches/{id}/export?format=csv|json
pub async fn export_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let job = lookup(&state, id)?.snapshot();
    let body = export::export(&job, query.format)?;

    let mut response = (
        [(header::CONTENT_TYPE, query.format.content_type())],
        body,
    )
        .into_response();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&job.id.to_string()) {
        headers.insert(BATCH_ID_HEADER, value);
    }
    match HeaderValue::from_str(&job.created_by) {
        Ok(value) => {
            headers.insert(CREATED_BY_HEADER, value);
        }
        Err(_) => tracing::warn!(job_id = %job.id, "created_by is not a valid header value"),
    }

    Ok(response)
}

/// DELETE /api/v1/batches/{id}: discard a finished batch.
pub async fn delete_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    match state.batches.remove(id) {
        Some(Ok(_)) => {
            tracing::info!(job_id = %id, "Batch discarded");
            Ok(StatusCode::NO_CONTENT)
        }
        Some(Err(handle)) => Err(ApiError::Conflict(format!(
            "Batch still has work in progress ({})",
            handle.run_state()
        ))),
        None => Err(ApiError::NotFound(id)),
    }
}

/// GET /api/v1/batches/{id}/events: server-sent progress stream.
///
/// Starts with a `snapshot` event, then one `progress` event per transition.
/// Ends once the batch and all of its items are terminal.
pub async fn batch_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before snapshotting so no transition falls in between.
    let rx = state.batches.subscribe(id).ok_or(ApiError::NotFound(id))?;
    let job = lookup(&state, id)?.snapshot();
    let settled = job.is_settled();

    let initial = sse_event("snapshot", &job)
        .ok_or_else(|| ApiError::Internal("unserializable batch snapshot".to_string()))?;

    let updates = stream::unfold((rx, settled), move |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let finished = is_final(&event);
                    if let Some(sse) = sse_event("progress", &event) {
                        return Some((Ok::<_, Infallible>(sse), (rx, finished)));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %id, skipped, "Progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream::once(async move { Ok::<_, Infallible>(initial) }).chain(updates);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn lookup(state: &AppState, id: Uuid) -> Result<BatchHandle, ApiError> {
    state.batches.get(id).ok_or(ApiError::NotFound(id))
}

fn control(state: &AppState, id: Uuid, op: ControlOp) -> Result<Json<ControlResponse>, ApiError> {
    let handle = lookup(state, id)?;
    match op {
        ControlOp::Pause => handle.pause()?,
        ControlOp::Resume => handle.resume()?,
        ControlOp::Cancel => handle.cancel()?,
        ControlOp::Start => {
            return Err(ApiError::Conflict("Batches start on submission".to_string()))
        }
    }

    let job = handle.snapshot();
    Ok(Json(ControlResponse {
        batch_id: id,
        run_state: job.run_state,
        counts: job.counts(),
    }))
}

fn is_final(event: &ProgressEvent) -> bool {
    event.run_state.is_terminal()
        && event.items_done + event.items_failed + event.items_canceled == event.items_total
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Option<Event> {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode SSE event");
            None
        }
    }
}
