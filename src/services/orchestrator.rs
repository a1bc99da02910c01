use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::models::batch::{BatchError, BatchJob, ControlOp, ItemStatus, RunState};
use crate::models::prediction::{PredictionError, PredictionPayload};
use crate::models::progress::ProgressEvent;
use crate::services::inference::PredictionClient;
use crate::services::progress::ProgressReporter;
use crate::services::retry::{RetryDecision, RetryPolicy};

/// Drives batches to a terminal state through a prediction client.
///
/// One `run` call owns one batch; different batches may run in parallel on
/// the same orchestrator.
pub struct Orchestrator {
    client: Arc<dyn PredictionClient>,
    retry: RetryPolicy,
    call_timeout: Duration,
    max_in_flight: usize,
}

impl Orchestrator {
    /// Sequential dispatch: at most one outstanding prediction per batch.
    pub fn new(client: Arc<dyn PredictionClient>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            client,
            retry,
            call_timeout,
            max_in_flight: 1,
        }
    }

    /// Allow up to `n` outstanding predictions per batch. Dispatch still follows
    /// queue order; completion order may not.
    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    /// Run an `Idle` batch until it is `Completed` or `Canceled`, returning the
    /// final snapshot.
    ///
    /// Progress events reach the reporter from a separate task, so a slow
    /// reporter never holds up dispatch or control operations. Use
    /// [`BatchHandle::events_delivered`] to wait for the backlog.
    pub async fn run(&self, batch: &BatchHandle) -> Result<BatchJob, BatchError> {
        let delivering = batch.spawn_delivery();
        if let Err(e) = batch.start() {
            if delivering {
                batch.close_events();
            }
            return Err(e);
        }

        let job_id = batch.id();
        let started = std::time::Instant::now();
        metrics::counter!("batch_jobs_started_total").increment(1);
        metrics::gauge!("batch_jobs_active").increment(1.0);
        tracing::info!(
            job_id = %job_id,
            max_in_flight = self.max_in_flight,
            max_attempts = self.retry.max_attempts(),
            "Batch run started"
        );

        let mut in_flight = FuturesUnordered::new();

        loop {
            let capacity = self.max_in_flight.saturating_sub(in_flight.len());
            let plan = batch.plan_dispatch(capacity);

            for (index, scan_id) in plan.dispatched {
                in_flight.push(self.attempt(index, scan_id));
            }

            if in_flight.is_empty() && plan.run_state.is_terminal() {
                break;
            }

            let retry_at = plan.retry_at;
            let retry_gate = async move {
                match retry_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some((index, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    batch.record(index, outcome, &self.retry);
                }
                _ = batch.shared.wake.notified() => {}
                _ = retry_gate => {}
            }
        }

        let job = batch.snapshot();
        batch.close_events();
        let counts = job.counts();
        metrics::gauge!("batch_jobs_active").decrement(1.0);
        tracing::info!(
            job_id = %job_id,
            run_state = %job.run_state,
            items_done = counts.done,
            items_failed = counts.failed,
            items_canceled = counts.canceled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch run finished"
        );

        Ok(job)
    }

    async fn attempt(
        &self,
        index: usize,
        scan_id: String,
    ) -> (usize, Result<PredictionPayload, PredictionError>) {
        let start = std::time::Instant::now();
        let outcome = match tokio::time::timeout(self.call_timeout, self.client.predict(&scan_id)).await {
            Ok(result) => result,
            Err(_) => Err(PredictionError::timeout(format!(
                "no prediction within {}ms",
                self.call_timeout.as_millis()
            ))),
        };
        metrics::histogram!("prediction_call_seconds").record(start.elapsed().as_secs_f64());

        tracing::debug!(
            scan_id = %scan_id,
            duration_ms = start.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Prediction call returned"
        );

        (index, outcome)
    }
}

/// Shared, serialized access to one batch.
///
/// Every mutation happens under the batch's own lock and numbers and queues
/// its progress event before the lock is released.
#[derive(Clone)]
pub struct BatchHandle {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    state: Mutex<BatchState>,
    wake: Notify,
    reporter: Arc<dyn ProgressReporter>,
    /// Pending events, until the first `run` hands them to a delivery task.
    outbox: Mutex<Option<mpsc::UnboundedReceiver<ProgressEvent>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

struct BatchState {
    job: BatchJob,
    /// Indexes of `Queued` items, next to dispatch at the front.
    queue: VecDeque<QueueEntry>,
    sequence: u64,
    /// `None` once the run has finished.
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

struct QueueEntry {
    index: usize,
    /// Backoff gate for retried items.
    not_before: Option<Instant>,
}

struct DispatchPlan {
    dispatched: Vec<(usize, String)>,
    retry_at: Option<Instant>,
    run_state: RunState,
}

impl BatchHandle {
    pub fn new(job: BatchJob, reporter: Arc<dyn ProgressReporter>) -> Self {
        let queue = job
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == ItemStatus::Queued)
            .map(|(index, _)| QueueEntry {
                index,
                not_before: None,
            })
            .collect();
        let (events, outbox) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                id: job.id,
                state: Mutex::new(BatchState {
                    job,
                    queue,
                    sequence: 0,
                    events: Some(events),
                }),
                wake: Notify::new(),
                reporter,
                outbox: Mutex::new(Some(outbox)),
                delivery: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Point-in-time copy of the job.
    pub fn snapshot(&self) -> BatchJob {
        self.shared.state.lock().job.clone()
    }

    pub fn run_state(&self) -> RunState {
        self.shared.state.lock().job.run_state
    }

    /// Stop dispatching new items. The in-flight item, if any, still finishes.
    pub fn pause(&self) -> Result<(), BatchError> {
        let mut state = self.shared.state.lock();
        match state.job.run_state {
            RunState::Running => {
                state.job.run_state = RunState::Paused;
                state.emit(None);
                tracing::info!(job_id = %self.shared.id, "Batch paused");
                Ok(())
            }
            RunState::Paused => Ok(()),
            other => Err(invalid(ControlOp::Pause, other)),
        }
    }

    pub fn resume(&self) -> Result<(), BatchError> {
        let mut state = self.shared.state.lock();
        match state.job.run_state {
            RunState::Paused => {
                state.job.run_state = RunState::Running;
                state.emit(None);
                drop(state);
                tracing::info!(job_id = %self.shared.id, "Batch resumed");
                self.shared.wake.notify_one();
                Ok(())
            }
            other => Err(invalid(ControlOp::Resume, other)),
        }
    }

    /// Cancel every not-yet-dispatched item. In-flight calls are not aborted;
    /// their outcomes are recorded normally.
    pub fn cancel(&self) -> Result<(), BatchError> {
        self.cancel_from(&[RunState::Running, RunState::Paused])
    }

    /// Like [`cancel`](Self::cancel), but also stops a batch whose run has not
    /// started yet. Used on shutdown.
    pub(crate) fn abort(&self) -> Result<(), BatchError> {
        self.cancel_from(&[RunState::Idle, RunState::Running, RunState::Paused])
    }

    fn cancel_from(&self, allowed: &[RunState]) -> Result<(), BatchError> {
        let mut state = self.shared.state.lock();
        let current = state.job.run_state;
        if !allowed.contains(&current) {
            return Err(invalid(ControlOp::Cancel, current));
        }

        let now = Utc::now();
        state.job.run_state = RunState::Canceled;
        let pending: Vec<usize> = state.queue.drain(..).map(|e| e.index).collect();
        for index in &pending {
            state.job.items[*index].cancel(now);
            state.emit(Some(*index));
        }
        state.emit(None);
        drop(state);

        metrics::counter!("batch_jobs_canceled_total").increment(1);
        tracing::info!(
            job_id = %self.shared.id,
            from = %current,
            items_canceled = pending.len(),
            "Batch canceled"
        );
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Wait until every event of the run has reached the reporter. Returns
    /// once the run has finished and its backlog is delivered, or at once if
    /// no run has started.
    pub async fn events_delivered(&self) {
        let task = self.shared.delivery.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(job_id = %self.shared.id, error = %e, "Progress delivery task failed");
            }
        }
    }

    /// Start the task that feeds queued events to the reporter in sequence
    /// order. Returns `false` if an earlier run already took the outbox.
    fn spawn_delivery(&self) -> bool {
        let Some(mut outbox) = self.shared.outbox.lock().take() else {
            return false;
        };
        let reporter = Arc::clone(&self.shared.reporter);
        let job_id = self.shared.id;

        let task = tokio::spawn(async move {
            while let Some(event) = outbox.recv().await {
                let sequence = event.sequence;
                let reporter = Arc::clone(&reporter);
                // Reporters are synchronous and may block.
                match tokio::task::spawn_blocking(move || reporter.report(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        job_id = %job_id,
                        sequence,
                        error = %e,
                        "Progress reporter failed"
                    ),
                    Err(e) => tracing::error!(
                        job_id = %job_id,
                        sequence,
                        error = %e,
                        "Progress reporter panicked"
                    ),
                }
            }
        });
        *self.shared.delivery.lock() = Some(task);
        true
    }

    /// Drop the event sender; the delivery task ends after the backlog.
    fn close_events(&self) {
        self.shared.state.lock().events = None;
    }

    fn start(&self) -> Result<(), BatchError> {
        let mut state = self.shared.state.lock();
        match state.job.run_state {
            RunState::Idle => {
                state.job.run_state = RunState::Running;
                state.emit(None);
                Ok(())
            }
            other => Err(invalid(ControlOp::Start, other)),
        }
    }

    /// Move up to `capacity` ready items to `Processing`, and settle the job
    /// once every item is terminal.
    fn plan_dispatch(&self, capacity: usize) -> DispatchPlan {
        let mut state = self.shared.state.lock();
        let mut dispatched = Vec::new();
        let mut retry_at = None;

        if state.job.run_state == RunState::Running {
            let now = Instant::now();
            while dispatched.len() < capacity {
                let Some(entry) = state.queue.front() else {
                    break;
                };
                if let Some(at) = entry.not_before.filter(|at| *at > now) {
                    retry_at = Some(at);
                    break;
                }
                let index = entry.index;
                state.queue.pop_front();

                let item = &mut state.job.items[index];
                item.dispatch(Utc::now());
                dispatched.push((index, item.scan_id.clone()));
                state.emit(Some(index));
            }
        }

        if matches!(state.job.run_state, RunState::Running | RunState::Paused)
            && state.job.all_terminal()
        {
            state.job.run_state = RunState::Completed;
            state.emit(None);
            metrics::counter!("batch_jobs_completed_total").increment(1);
        }

        DispatchPlan {
            dispatched,
            retry_at,
            run_state: state.job.run_state,
        }
    }

    fn record(
        &self,
        index: usize,
        outcome: Result<PredictionPayload, PredictionError>,
        retry: &RetryPolicy,
    ) {
        let mut state = self.shared.state.lock();
        let now = Utc::now();
        let canceled = state.job.run_state == RunState::Canceled;
        let job_id = state.job.id;
        let item = &mut state.job.items[index];

        let requeue_at = match outcome {
            Ok(payload) => {
                item.succeed(payload, now);
                metrics::counter!("batch_items_succeeded_total").increment(1);
                None
            }
            Err(error) => {
                // A canceled batch never dispatches again, so give up immediately.
                let decision = if canceled {
                    RetryDecision::GiveUp
                } else {
                    retry.decide(item.attempts, &error)
                };
                match decision {
                    RetryDecision::Retry { delay } => {
                        tracing::warn!(
                            job_id = %job_id,
                            scan_id = %item.scan_id,
                            attempts = item.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Prediction failed, retrying"
                        );
                        item.requeue(error);
                        metrics::counter!("batch_item_retries_total").increment(1);
                        Some(Instant::now() + delay)
                    }
                    RetryDecision::GiveUp => {
                        tracing::warn!(
                            job_id = %job_id,
                            scan_id = %item.scan_id,
                            attempts = item.attempts,
                            error = %error,
                            "Prediction failed permanently"
                        );
                        item.fail(error, now);
                        metrics::counter!("batch_items_failed_total").increment(1);
                        None
                    }
                }
            }
        };

        if let Some(at) = requeue_at {
            // Retries wait ahead of fresh items, in scan order among themselves.
            let len = state.queue.len();
            let position = state
                .queue
                .iter()
                .position(|entry| entry.not_before.is_none() || entry.index > index)
                .unwrap_or(len);
            state.queue.insert(
                position,
                QueueEntry {
                    index,
                    not_before: Some(at),
                },
            );
        }
        state.emit(Some(index));
    }
}

impl BatchState {
    /// Number the transition and queue its event; delivery happens elsewhere.
    fn emit(&mut self, index: Option<usize>) {
        self.sequence += 1;
        let Some(events) = &self.events else {
            return;
        };
        let event = ProgressEvent::snapshot(
            &self.job,
            self.sequence,
            index.map(|i| &self.job.items[i]),
        );
        if events.send(event).is_err() {
            tracing::warn!(
                job_id = %self.job.id,
                sequence = self.sequence,
                "Progress delivery stopped"
            );
        }
    }
}

fn invalid(operation: ControlOp, state: RunState) -> BatchError {
    BatchError::InvalidTransition { operation, state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::progress::ChannelReporter;

    #[test]
    fn test_control_ops_on_idle_batch_are_rejected() {
        let job = BatchJob::new(["a", "b"], "u").unwrap();
        let (reporter, mut rx) = ChannelReporter::new();
        let batch = BatchHandle::new(job, Arc::new(reporter));

        for (result, op) in [
            (batch.pause(), ControlOp::Pause),
            (batch.resume(), ControlOp::Resume),
            (batch.cancel(), ControlOp::Cancel),
        ] {
            assert_eq!(
                result,
                Err(BatchError::InvalidTransition {
                    operation: op,
                    state: RunState::Idle
                })
            );
        }
        assert_eq!(batch.run_state(), RunState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_marks_queued_items_and_emits_in_order() {
        let job = BatchJob::new(["a", "b", "c"], "u").unwrap();
        let (reporter, mut rx) = ChannelReporter::new();
        let batch = BatchHandle::new(job, Arc::new(reporter));

        assert!(batch.spawn_delivery());
        assert!(!batch.spawn_delivery());
        batch.start().unwrap();
        let plan = batch.plan_dispatch(1);
        assert_eq!(plan.dispatched, vec![(0, "a".to_string())]);

        batch.cancel().unwrap();
        let job = batch.snapshot();
        assert_eq!(job.run_state, RunState::Canceled);
        assert_eq!(job.items[0].status, ItemStatus::Processing);
        assert_eq!(job.items[1].status, ItemStatus::Canceled);
        assert_eq!(job.items[2].status, ItemStatus::Canceled);

        batch.close_events();
        batch.events_delivered().await;
        let sequences: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.sequence)
            .collect();
        // start, dispatch a, cancel b, cancel c, job canceled
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_abort_stops_batch_before_it_starts() {
        let job = BatchJob::new(["a", "b"], "u").unwrap();
        let batch = BatchHandle::new(job, Arc::new(ChannelReporter::new().0));

        batch.abort().unwrap();
        let job = batch.snapshot();
        assert_eq!(job.run_state, RunState::Canceled);
        assert!(job.is_settled());
        assert_eq!(job.counts().canceled, 2);

        assert_eq!(
            batch.start(),
            Err(BatchError::InvalidTransition {
                operation: ControlOp::Start,
                state: RunState::Canceled
            })
        );
        assert!(batch.abort().is_err());
    }

    #[test]
    fn test_retry_is_queued_ahead_of_fresh_items() {
        let job = BatchJob::new(["a", "b"], "u").unwrap();
        let batch = BatchHandle::new(job, Arc::new(ChannelReporter::new().0));
        let retry = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);

        batch.start().unwrap();
        let plan = batch.plan_dispatch(1);
        assert_eq!(plan.dispatched[0].1, "a");

        batch.record(0, Err(PredictionError::timeout("slow")), &retry);
        assert_eq!(batch.snapshot().items[0].status, ItemStatus::Queued);

        let plan = batch.plan_dispatch(1);
        assert_eq!(plan.dispatched, vec![(0, "a".to_string())]);
        assert_eq!(batch.snapshot().items[0].attempts, 2);
    }

    #[test]
    fn test_retries_keep_dispatch_order_whatever_order_they_fail_in() {
        let job = BatchJob::new(["a", "b", "c", "d"], "u").unwrap();
        let batch = BatchHandle::new(job, Arc::new(ChannelReporter::new().0));
        let retry = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);

        batch.start().unwrap();
        let plan = batch.plan_dispatch(3);
        assert_eq!(plan.dispatched.len(), 3);

        batch.record(2, Err(PredictionError::timeout("slow")), &retry);
        batch.record(0, Err(PredictionError::timeout("slow")), &retry);
        batch.record(1, Err(PredictionError::timeout("slow")), &retry);

        let order: Vec<usize> = batch
            .plan_dispatch(4)
            .dispatched
            .into_iter()
            .map(|(index, _)| index)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
