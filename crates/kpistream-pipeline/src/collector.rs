//! Sample intake.
//!
//! A cloneable handle over a bounded mpsc queue feeding the aggregator. A full
//! queue makes producers wait; nothing is dropped silently. Refused samples are
//! handed back inside the error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kpistream_core::error::CoreError;
use kpistream_core::models::sample::Sample;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

/// A sample the collector did not accept
#[derive(Debug, thiserror::Error)]
#[error("sample {:?} refused: {error}", .sample.label)]
pub struct SubmitError {
    /// The refused sample, for the producer to keep or discard
    pub sample: Box<Sample>,
    #[source]
    pub error: CoreError,
}

impl SubmitError {
    fn closed(sample: Sample) -> Self {
        Self {
            sample: Box::new(sample),
            error: CoreError::IntakeClosed,
        }
    }

    pub fn into_sample(self) -> Sample {
        *self.sample
    }
}

/// Producer handle
#[derive(Debug, Clone)]
pub struct SampleCollector {
    tx: mpsc::Sender<Sample>,
    submitted: Arc<AtomicU64>,
}

impl SampleCollector {
    /// Collector and the receiving end for the aggregator.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                submitted: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue, waiting while the queue is full.
    pub async fn submit(&self, sample: Sample) -> Result<(), SubmitError> {
        self.tx
            .send(sample)
            .await
            .map_err(|e| SubmitError::closed(e.0))?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Blocking variant for producer threads outside the runtime.
    ///
    /// Panics if called from within an async context, like
    /// `mpsc::Sender::blocking_send`.
    pub fn submit_blocking(&self, sample: Sample) -> Result<(), SubmitError> {
        self.tx
            .blocking_send(sample)
            .map_err(|e| SubmitError::closed(e.0))?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue, waiting at most `wait` for room.
    pub async fn try_submit_for(&self, sample: Sample, wait: Duration) -> Result<(), SubmitError> {
        self.tx.send_timeout(sample, wait).await.map_err(|e| match e {
            SendTimeoutError::Timeout(sample) => SubmitError {
                sample: Box::new(sample),
                error: CoreError::QueueTimeout {
                    waited_ms: wait.as_millis() as u64,
                },
            },
            SendTimeoutError::Closed(sample) => SubmitError::closed(sample),
        })?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Samples accepted so far, across all clones.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn sample(label: &str) -> Sample {
        Sample::new(label, Utc::now(), 0.1)
    }

    #[tokio::test]
    async fn submit_counts_across_clones() {
        let (collector, mut rx) = SampleCollector::channel(8);
        let other = collector.clone();
        collector.submit(sample("a")).await.unwrap();
        other.submit(sample("b")).await.unwrap();

        assert_eq!(collector.submitted(), 2);
        assert_eq!(rx.recv().await.unwrap().label, "a");
        assert_eq!(rx.recv().await.unwrap().label, "b");
    }

    #[tokio::test]
    async fn full_queue_times_out_and_returns_sample() {
        let (collector, _rx) = SampleCollector::channel(1);
        collector.submit(sample("first")).await.unwrap();

        let err = collector
            .try_submit_for(sample("second"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_matches!(err.error, CoreError::QueueTimeout { waited_ms: 20 });
        assert_eq!(err.into_sample().label, "second");
        assert_eq!(collector.submitted(), 1);
    }

    #[tokio::test]
    async fn submit_waits_for_room() {
        let (collector, mut rx) = SampleCollector::channel(1);
        collector.submit(sample("a")).await.unwrap();

        let producer = collector.clone();
        let pending = tokio::spawn(async move { producer.submit(sample("b")).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        rx.recv().await.unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().label, "b");
    }

    #[tokio::test]
    async fn closed_intake_hands_sample_back() {
        let (collector, mut rx) = SampleCollector::channel(4);
        rx.close();

        let err = collector.submit(sample("late")).await.unwrap_err();
        assert_matches!(err.error, CoreError::IntakeClosed);
        assert_eq!(err.sample.label, "late");
        assert!(collector.is_closed());
        assert_eq!(collector.submitted(), 0);
    }

    #[test]
    fn blocking_submit_from_thread() {
        let (collector, mut rx) = SampleCollector::channel(4);
        let handle = std::thread::spawn(move || collector.submit_blocking(sample("t")));
        handle.join().unwrap().unwrap();
        assert_eq!(rx.blocking_recv().unwrap().label, "t");
    }
}
