use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::batch::{BatchError, BatchJob, RunState};
use crate::models::progress::ProgressEvent;
use crate::services::orchestrator::{BatchHandle, Orchestrator};
use crate::services::progress::{BroadcastReporter, FanoutReporter, ProgressReporter, TracingReporter};

/// Buffered events per SSE subscriber before it starts losing events.
const EVENT_BUFFER: usize = 256;

struct Entry {
    handle: BatchHandle,
    events: Arc<BroadcastReporter>,
}

/// Live batches of this process. Nothing here survives a restart.
pub struct BatchRegistry {
    orchestrator: Arc<Orchestrator>,
    batches: RwLock<HashMap<Uuid, Entry>>,
}

impl BatchRegistry {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Register a job and start running it in the background.
    pub fn submit(&self, job: BatchJob) -> BatchHandle {
        let events = Arc::new(BroadcastReporter::new(EVENT_BUFFER));
        let log: Arc<dyn ProgressReporter> = Arc::new(TracingReporter);
        let stream: Arc<dyn ProgressReporter> = events.clone();
        let reporter: Arc<dyn ProgressReporter> = Arc::new(FanoutReporter::new(vec![log, stream]));

        let handle = BatchHandle::new(job, reporter);
        self.batches.write().insert(
            handle.id(),
            Entry {
                handle: handle.clone(),
                events,
            },
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let running = handle.clone();
        tokio::spawn(async move {
            match orchestrator.run(&running).await {
                Ok(_) => {}
                Err(BatchError::InvalidTransition {
                    state: RunState::Canceled,
                    ..
                }) => {
                    tracing::info!(job_id = %running.id(), "Batch canceled before it started");
                }
                Err(e) => {
                    tracing::error!(job_id = %running.id(), error = %e, "Batch run refused");
                }
            }
        });

        handle
    }

    pub fn get(&self, id: Uuid) -> Option<BatchHandle> {
        self.batches.read().get(&id).map(|entry| entry.handle.clone())
    }

    pub fn subscribe(&self, id: Uuid) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.batches.read().get(&id).map(|entry| entry.events.subscribe())
    }

    /// Discard a batch. Returns the removed handle, or `None` if unknown.
    ///
    /// Batches with work still running (including the in-flight item of a
    /// canceled batch) are kept and returned as `Err`.
    pub fn remove(&self, id: Uuid) -> Option<Result<BatchHandle, BatchHandle>> {
        let mut batches = self.batches.write();
        let entry = batches.get(&id)?;
        if !entry.handle.snapshot().is_settled() {
            return Some(Err(entry.handle.clone()));
        }
        batches.remove(&id).map(|entry| Ok(entry.handle))
    }

    pub fn active_count(&self) -> usize {
        self.batches
            .read()
            .values()
            .filter(|entry| !entry.handle.run_state().is_terminal())
            .count()
    }

    /// Cancel every active batch, including ones whose run has not started,
    /// e.g. on shutdown, so unfinished work is reported as canceled instead of
    /// silently disappearing.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<BatchHandle> = self
            .batches
            .read()
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        handles
            .iter()
            .filter(|handle| !handle.run_state().is_terminal())
            .filter(|handle| handle.abort().is_ok())
            .count()
    }

    /// Drop batches that settled more than `retention` ago. Returns how many
    /// were evicted.
    pub fn evict_settled(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };

        let mut batches = self.batches.write();
        let before = batches.len();
        batches.retain(|_, entry| {
            entry
                .handle
                .snapshot()
                .settled_at()
                .map_or(true, |settled| settled > cutoff)
        });
        let evicted = before - batches.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = batches.len(), "Evicted settled batches");
        }
        evicted
    }
}
