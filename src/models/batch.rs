use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::prediction::{PredictionError, PredictionPayload};

/// Status of a single scan within a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Succeeded | ItemStatus::Failed | ItemStatus::Canceled
        )
    }
}

/// Job-level run state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Canceled,
    Completed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Canceled | RunState::Completed)
    }
}

/// One scan's unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub scan_id: String,
    pub status: ItemStatus,
    pub attempts: u32,
    pub result: Option<PredictionPayload>,
    /// Kept after a later successful retry for audit.
    pub last_error: Option<PredictionError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchItem {
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            status: ItemStatus::Queued,
            attempts: 0,
            result: None,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Queued -> Processing. Counts the attempt; `started_at` marks the current attempt.
    pub(crate) fn dispatch(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
    }

    pub(crate) fn succeed(&mut self, payload: PredictionPayload, now: DateTime<Utc>) {
        self.status = ItemStatus::Succeeded;
        self.result = Some(payload);
        self.finished_at = Some(now);
    }

    /// Processing -> Queued, waiting for another attempt. A queued item has no
    /// start time.
    pub(crate) fn requeue(&mut self, error: PredictionError) {
        self.status = ItemStatus::Queued;
        self.started_at = None;
        self.last_error = Some(error);
    }

    pub(crate) fn fail(&mut self, error: PredictionError, now: DateTime<Utc>) {
        self.status = ItemStatus::Failed;
        self.last_error = Some(error);
        self.finished_at = Some(now);
    }

    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Canceled;
        self.finished_at = Some(now);
    }
}

/// One user-initiated run over a fixed set of scans.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub id: Uuid,
    /// Selection order, preserved for the whole run.
    pub items: Vec<BatchItem>,
    pub run_state: RunState,
    /// Opaque initiator tag; not validated here.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl BatchJob {
    /// Snapshot a selection into a new `Idle` job. Scan ids must be unique.
    pub fn new<I, S>(scan_ids: I, created_by: impl Into<String>) -> Result<Self, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for scan_id in scan_ids {
            let scan_id = scan_id.into();
            if !seen.insert(scan_id.clone()) {
                return Err(BatchError::DuplicateScan(scan_id));
            }
            items.push(BatchItem::new(scan_id));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            items,
            run_state: RunState::Idle,
            created_by: created_by.into(),
            created_at: Utc::now(),
        })
    }

    pub fn all_terminal(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }

    /// The job and every item are terminal; nothing will change any more.
    pub fn is_settled(&self) -> bool {
        self.run_state.is_terminal() && self.all_terminal()
    }

    /// When the last item finished, for settled jobs only.
    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_settled() {
            return None;
        }
        let last = self.items.iter().filter_map(|item| item.finished_at).max();
        Some(last.unwrap_or(self.created_at))
    }

    pub fn counts(&self) -> ItemCounts {
        let mut counts = ItemCounts {
            total: self.items.len(),
            ..ItemCounts::default()
        };
        for item in &self.items {
            match item.status {
                ItemStatus::Succeeded => counts.done += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::Canceled => counts.canceled += 1,
                ItemStatus::Queued | ItemStatus::Processing => {}
            }
        }
        counts
    }

    pub fn item(&self, scan_id: &str) -> Option<&BatchItem> {
        self.items.iter().find(|item| item.scan_id == scan_id)
    }
}

/// Tally of terminal item states.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemCounts {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// Control operations on a running batch.
#[derive(Debug, Clone, Copy, Serialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ControlOp {
    Start,
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    #[error("Cannot {operation} a batch that is {state}")]
    InvalidTransition { operation: ControlOp, state: RunState },

    #[error("Scan {0} selected more than once")]
    DuplicateScan(String),
}
