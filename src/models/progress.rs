use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::batch::{BatchItem, BatchJob, RunState};

/// One observed transition of a batch or of one of its items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: Uuid,
    /// Per-job, strictly increasing from 1.
    pub sequence: u64,
    pub items_total: usize,
    pub items_done: usize,
    pub items_failed: usize,
    pub items_canceled: usize,
    pub run_state: RunState,
    /// Present on item-level transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<BatchItem>,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub(crate) fn snapshot(job: &BatchJob, sequence: u64, item: Option<&BatchItem>) -> Self {
        let counts = job.counts();
        Self {
            job_id: job.id,
            sequence,
            items_total: counts.total,
            items_done: counts.done,
            items_failed: counts.failed,
            items_canceled: counts.canceled,
            run_state: job.run_state,
            item: item.cloned(),
            emitted_at: Utc::now(),
        }
    }
}
