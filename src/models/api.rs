use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::batch::{ItemCounts, RunState};
use crate::models::export::ExportFormat;

/// Request to start a batch over a selection of scans (at most 1000).
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    #[garde(length(min = 1, max = 1000), inner(length(min = 1, max = 256)))]
    pub scan_ids: Vec<String>,

    #[garde(length(min = 1, max = 200))]
    pub created_by: String,
}

/// Response after a batch is accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreatedResponse {
    pub batch_id: Uuid,
    pub run_state: RunState,
    pub items_total: usize,
}

/// Response for a control operation (pause / resume / cancel).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub batch_id: Uuid,
    pub run_state: RunState,
    pub counts: ItemCounts,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
