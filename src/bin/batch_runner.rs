use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use scan_batch::{
    config::AppConfig,
    models::{
        batch::{BatchJob, RunState},
        export::ExportFormat,
    },
    services::{
        export, inference::HttpPredictionClient, orchestrator::{BatchHandle, Orchestrator},
        progress::TracingReporter,
    },
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Runner-only options, read from `BATCH_`-prefixed variables.
#[derive(Debug, Deserialize)]
struct RunnerOptions {
    #[serde(default = "default_created_by")]
    created_by: String,

    #[serde(default)]
    export_format: ExportFormat,
}

fn default_created_by() -> String {
    "batch-runner".to_string()
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the export.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(io::stderr)
        .init();

    match run().await {
        Ok(RunState::Completed) => ExitCode::SUCCESS,
        Ok(state) => {
            tracing::warn!(run_state = %state, "Batch did not complete; nothing exported");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "Batch runner failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<RunState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    let options: RunnerOptions = envy::prefixed("BATCH_").from_env()?;

    let scan_ids = read_scan_ids(io::stdin().lock())?;
    tracing::info!(
        scans = scan_ids.len(),
        created_by = %options.created_by,
        format = %options.export_format,
        "Loaded scan selection"
    );

    let client = HttpPredictionClient::new(
        &config.inference_url,
        config.inference_api_token.clone(),
        config.call_timeout(),
    )?;
    let orchestrator = Orchestrator::new(Arc::new(client), config.retry_policy(), config.call_timeout())
        .with_max_in_flight(config.max_in_flight);

    let job = BatchJob::new(scan_ids, options.created_by)?;
    let batch = BatchHandle::new(job, Arc::new(TracingReporter));

    // ctrl-c cancels the remaining scans; the in-flight one still finishes.
    let cancel_on_signal = batch.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = cancel_on_signal.cancel() {
                tracing::warn!(error = %e, "Cancel on signal ignored");
            }
        }
    });

    let job = orchestrator.run(&batch).await?;
    batch.events_delivered().await;
    if job.run_state == RunState::Completed {
        let payload = export::export(&job, options.export_format)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&payload)?;
        stdout.flush()?;
    }

    Ok(job.run_state)
}

/// One scan id per line; surrounding whitespace and blank lines are ignored.
fn read_scan_ids(input: impl BufRead) -> io::Result<Vec<String>> {
    let mut ids = Vec::new();
    for line in input.lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_scan_ids_skips_blank_lines() {
        let input = "scan-1\n\n  scan-2  \r\n\nscan-3";
        let ids = read_scan_ids(input.as_bytes()).unwrap();
        assert_eq!(ids, vec!["scan-1", "scan-2", "scan-3"]);
    }
}
