use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::batch::{BatchItem, ItemStatus};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ExportFormat {
    Csv,
    #[default]
    Json,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }
}

/// One exported row; field names are the export column names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub scan_id: String,
    pub status: ItemStatus,
    pub prediction: Option<String>,
    pub confidence: Option<f64>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl From<&BatchItem> for ExportRecord {
    fn from(item: &BatchItem) -> Self {
        // Errors recovered from by a later retry stay on the item, not in the export.
        let error = match item.status {
            ItemStatus::Succeeded => None,
            _ => item.last_error.as_ref().map(ToString::to_string),
        };

        Self {
            scan_id: item.scan_id.clone(),
            status: item.status,
            prediction: item.result.as_ref().map(|r| r.label.clone()),
            confidence: item.result.as_ref().map(|r| r.confidence),
            attempts: item.attempts,
            error,
        }
    }
}
