//! Scan batch analysis
//!
//! Runs a researcher-selected set of scans through an external inference
//! endpoint with retry, pause/resume/cancel, live progress and CSV/JSON export
//! of the consolidated results.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
