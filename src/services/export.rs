use crate::models::batch::{BatchJob, RunState};
use crate::models::export::{ExportFormat, ExportRecord};

/// Column order of the CSV export.
pub const CSV_HEADER: [&str; 6] = ["scanId", "status", "prediction", "confidence", "attempts", "error"];

/// Collect one record per item, in selection order.
pub fn collect_records(job: &BatchJob) -> Vec<ExportRecord> {
    job.items.iter().map(ExportRecord::from).collect()
}

/// Serialize the outcome of a completed batch.
///
/// Jobs that are not `Completed` are rejected rather than partially exported.
pub fn export(job: &BatchJob, format: ExportFormat) -> Result<Vec<u8>, ExportError> {
    if job.run_state != RunState::Completed {
        return Err(ExportError::NotCompleted(job.run_state));
    }

    let records = collect_records(job);
    tracing::debug!(
        job_id = %job.id,
        format = %format,
        records = records.len(),
        "Exporting batch results"
    );

    match format {
        ExportFormat::Json => serde_json::to_vec_pretty(&records).map_err(ExportError::Serialize),
        ExportFormat::Csv => Ok(to_csv(&records).into_bytes()),
    }
}

fn to_csv(records: &[ExportRecord]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push_str("\r\n");

    for record in records {
        let fields = [
            csv_field(&record.scan_id),
            csv_field(&record.status.to_string()),
            csv_field(record.prediction.as_deref().unwrap_or_default()),
            record.confidence.map(|c| c.to_string()).unwrap_or_default(),
            record.attempts.to_string(),
            csv_field(record.error.as_deref().unwrap_or_default()),
        ];
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

/// Quote a field when it contains a delimiter, quote or line break (RFC 4180).
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Batch is {0}; only completed batches can be exported")]
    NotCompleted(RunState),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
