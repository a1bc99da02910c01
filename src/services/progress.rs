//! Progress reporting for batch runs.
//!
//! Events are numbered under the batch state lock and handed to the reporter
//! one at a time, in sequence order, by a delivery task of their own. A slow
//! reporter only delays its own events. A reporter that cannot deliver returns
//! an error, which is logged and dropped.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::models::progress::ProgressEvent;

/// Observer of batch transitions.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent) -> Result<(), ReporterError>;
}

/// Writes every transition to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: &ProgressEvent) -> Result<(), ReporterError> {
        match &event.item {
            Some(item) => tracing::info!(
                job_id = %event.job_id,
                sequence = event.sequence,
                scan_id = %item.scan_id,
                status = %item.status,
                attempts = item.attempts,
                "Batch item transition"
            ),
            None => tracing::info!(
                job_id = %event.job_id,
                sequence = event.sequence,
                run_state = %event.run_state,
                items_total = event.items_total,
                items_done = event.items_done,
                items_failed = event.items_failed,
                items_canceled = event.items_canceled,
                "Batch transition"
            ),
        }
        Ok(())
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: &ProgressEvent) -> Result<(), ReporterError> {
        self.tx
            .send(event.clone())
            .map_err(|_| ReporterError::Closed)
    }
}

/// Fans events out to any number of live subscribers (e.g. SSE streams).
///
/// Subscribers that fall more than the channel capacity behind lose events.
pub struct BroadcastReporter {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressReporter for BroadcastReporter {
    fn report(&self, event: &ProgressEvent) -> Result<(), ReporterError> {
        // No subscribers is not a failure.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Delivers to every child; a failing child does not starve the others.
#[derive(Default)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl FanoutReporter {
    pub fn new(reporters: Vec<Arc<dyn ProgressReporter>>) -> Self {
        Self { reporters }
    }
}

impl ProgressReporter for FanoutReporter {
    fn report(&self, event: &ProgressEvent) -> Result<(), ReporterError> {
        let mut first_error = None;
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(event) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("Progress receiver closed")]
    Closed,

    #[error("Progress delivery failed: {0}")]
    Delivery(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batch::BatchJob;

    struct Failing;

    impl ProgressReporter for Failing {
        fn report(&self, _event: &ProgressEvent) -> Result<(), ReporterError> {
            Err(ReporterError::Delivery("sink offline".to_string()))
        }
    }

    fn event(sequence: u64) -> ProgressEvent {
        let job = BatchJob::new(["a"], "u").unwrap();
        ProgressEvent::snapshot(&job, sequence, None)
    }

    #[test]
    fn test_channel_reporter_preserves_order() {
        let (reporter, mut rx) = ChannelReporter::new();
        for seq in 1..=3 {
            reporter.report(&event(seq)).unwrap();
        }
        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_channel_reporter_closed() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);
        assert!(matches!(reporter.report(&event(1)), Err(ReporterError::Closed)));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let reporter = BroadcastReporter::new(8);
        assert!(reporter.report(&event(1)).is_ok());
    }

    #[test]
    fn test_fanout_continues_past_failure() {
        let (channel, mut rx) = ChannelReporter::new();
        let fanout = FanoutReporter::new(vec![Arc::new(Failing), Arc::new(channel)]);

        assert!(fanout.report(&event(7)).is_err());
        assert_eq!(rx.try_recv().unwrap().sequence, 7);
    }
}
