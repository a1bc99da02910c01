//! Scan selections used across the batch tests

#![allow(dead_code)]

/// Three scans, as in the retry walkthrough.
pub const TRIO: &[&str] = &["scan-A", "scan-B", "scan-C"];

/// A longer selection for pause/cancel and concurrency tests.
pub const SERIES: &[&str] = &[
    "mri-0001", "mri-0002", "mri-0003", "mri-0004", "mri-0005", "mri-0006",
];

/// Identifier of the researcher who starts the test batches.
pub const RESEARCHER: &str = "researcher-42";

pub fn selection(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
