//! Test helper utilities for batch orchestration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use scan_batch::models::prediction::{ErrorKind, PredictionError, PredictionPayload};
use scan_batch::models::progress::ProgressEvent;
use scan_batch::services::inference::PredictionClient;
use scan_batch::services::progress::{ProgressReporter, ReporterError};

/// What the stub does on one call for a scan.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(ErrorKind),
    Hang(Duration),
}

/// Lets a test hold one call open until it decides to release it.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until the gated call is in flight.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Deterministic prediction stub driven by per-scan scripts.
///
/// Scans without a script (or with an exhausted one) succeed.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    latency: Duration,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn script(self, scan_id: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .insert(scan_id.to_string(), steps.into_iter().collect());
        self
    }

    /// Hold the next call for `scan_id` until the returned gate is released.
    pub fn gate(&self, scan_id: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().insert(scan_id.to_string(), gate.clone());
        gate
    }

    /// Scan ids in the order calls were made.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub fn payload_for(scan_id: &str) -> PredictionPayload {
    PredictionPayload {
        label: format!("label-{scan_id}"),
        confidence: 0.9,
        probabilities: BTreeMap::from([(format!("label-{scan_id}"), 0.9)]),
        volumetry: None,
        model_version: "stub-1".to_string(),
    }
}

#[async_trait]
impl PredictionClient for ScriptedClient {
    async fn predict(&self, scan_id: &str) -> Result<PredictionPayload, PredictionError> {
        self.calls.lock().push(scan_id.to_string());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        let gate = self.gates.lock().remove(scan_id);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let step = self
            .scripts
            .lock()
            .get_mut(scan_id)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed);

        let outcome = match step {
            Step::Succeed => Ok(payload_for(scan_id)),
            Step::Fail(kind) => Err(PredictionError::new(kind, format!("scripted {kind}"))),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(payload_for(scan_id))
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Reporter that always fails, to show the run does not depend on delivery.
pub struct BrokenReporter;

impl ProgressReporter for BrokenReporter {
    fn report(&self, _event: &ProgressEvent) -> Result<(), ReporterError> {
        Err(ReporterError::Delivery("observer offline".to_string()))
    }
}

/// Reporter that blocks on every event and records the sequences it saw.
pub struct SlowReporter {
    delay: Duration,
    seen: Mutex<Vec<u64>>,
}

impl SlowReporter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.seen.lock().clone()
    }
}

impl ProgressReporter for SlowReporter {
    fn report(&self, event: &ProgressEvent) -> Result<(), ReporterError> {
        std::thread::sleep(self.delay);
        self.seen.lock().push(event.sequence);
        Ok(())
    }
}

/// Everything received so far, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Wait for the first event matching `pred`, failing the test after 5 seconds.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<ProgressEvent>,
    pred: impl Fn(&ProgressEvent) -> bool,
) -> ProgressEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("reporter channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for progress event")
}

/// Minimal RFC 4180 reader for the export: quoted fields, doubled quotes, CRLF rows.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (quoted, c) {
            (true, '"') if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            (true, '"') => quoted = false,
            (true, c) => field.push(c),
            (false, '"') => quoted = true,
            (false, ',') => row.push(std::mem::take(&mut field)),
            (false, '\r') => {}
            (false, '\n') => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            (false, c) => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}
