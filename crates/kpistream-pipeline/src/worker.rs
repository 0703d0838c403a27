//! Delivery worker.
//!
//! Takes snapshots off the pending queue one at a time: encode, deliver, record.
//! One request in flight keeps intervals in order.

use std::collections::BTreeMap;
use std::sync::Arc;

use kpistream_core::credential::Credential;
use kpistream_core::models::delivery::DeliveryResult;
use kpistream_core::models::session::SessionStatus;
use kpistream_core::models::snapshot::AggregateSnapshot;
use kpistream_network::delivery::DeliveryClient;
use kpistream_network::encoder::PayloadEncoder;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::session::Control;
use crate::state::SharedState;

pub struct DeliveryWorker {
    encoder: PayloadEncoder,
    delivery: DeliveryClient,
    credential: Credential,
    tags: BTreeMap<String, String>,
    state: SharedState,
    control: Arc<watch::Sender<Control>>,
}

impl DeliveryWorker {
    pub fn new(
        encoder: PayloadEncoder,
        delivery: DeliveryClient,
        credential: Credential,
        tags: BTreeMap<String, String>,
        state: SharedState,
        control: Arc<watch::Sender<Control>>,
    ) -> Self {
        Self {
            encoder,
            delivery,
            credential,
            tags,
            state,
            control,
        }
    }

    /// Deliver queued snapshots until the queue closes or the session aborts.
    pub async fn run(self: Arc<Self>, mut snapshots: mpsc::Receiver<AggregateSnapshot>) {
        while let Some(snapshot) = snapshots.recv().await {
            if self.process(&snapshot).await {
                break;
            }
        }
        debug!("delivery worker stopped");
    }

    /// Encode and deliver one snapshot. Returns `true` if the session was aborted.
    pub async fn process(&self, snapshot: &AggregateSnapshot) -> bool {
        let payload = match self.encoder.encode(snapshot, &self.credential, &self.tags) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "dropping #{} ({}): {e}",
                    snapshot.sequence,
                    snapshot.window_display()
                );
                self.state.lock().record_delivery(&DeliveryResult::Dropped {
                    reason: e.to_string(),
                    attempts: 0,
                });
                return false;
            }
        };

        let result = self.delivery.deliver(&payload).await;
        if let DeliveryResult::Delivered { attempts } = &result {
            let tag = if snapshot.is_final { " (final)" } else { "" };
            info!(
                "sent #{}{tag}: {} samples, {} metrics, {attempts} attempt(s)",
                snapshot.sequence, snapshot.overall.total, payload.metric_count
            );
        }

        let mut state = self.state.lock();
        if state.record_delivery(&result) {
            state.finish(SessionStatus::AuthFailed);
            drop(state);
            self.control.send_replace(Control::Abort);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use kpistream_core::config::RetryConfig;
    use kpistream_core::credential::CredentialSource;
    use kpistream_core::error::CoreError;
    use kpistream_core::models::delivery::{EncodedPayload, IngestResponse};
    use kpistream_core::models::snapshot::KpiSet;
    use kpistream_core::ports::ingest_client::IngestClient;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::state::SessionState;

    struct FixedStatus {
        status: u16,
        calls: AtomicU32,
    }

    #[async_trait]
    impl IngestClient for FixedStatus {
        async fn post(&self, _payload: &EncodedPayload) -> Result<IngestResponse, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IngestResponse {
                status: self.status,
                body: String::new(),
                retry_after_secs: None,
            })
        }
    }

    fn snapshot(sequence: u64) -> AggregateSnapshot {
        AggregateSnapshot {
            sequence,
            window_start: Utc::now(),
            window_end: Utc::now(),
            overall: KpiSet {
                total: 1,
                success: 1,
                ..KpiSet::default()
            },
            labels: Default::default(),
            cumulative: Default::default(),
            rejected: 0,
            tags: Default::default(),
            is_final: false,
        }
    }

    fn worker(status: u16, threshold: u32) -> (Arc<DeliveryWorker>, SharedState, watch::Receiver<Control>) {
        let ingest = Arc::new(FixedStatus {
            status,
            calls: AtomicU32::new(0),
        });
        let retry = RetryConfig {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let state = SessionState::new("s", threshold).shared();
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let worker = DeliveryWorker::new(
            PayloadEncoder::new("p", "s"),
            DeliveryClient::new(ingest, retry),
            Credential::new("key-0000", CredentialSource::Config),
            BTreeMap::new(),
            state.clone(),
            Arc::new(control_tx),
        );
        (Arc::new(worker), state, control_rx)
    }

    #[tokio::test]
    async fn delivers_queue_in_order() {
        let (worker, state, _control) = worker(202, 3);
        let (tx, rx) = mpsc::channel(4);
        for seq in 1..=3 {
            tx.send(snapshot(seq)).await.unwrap();
        }
        drop(tx);
        worker.run(rx).await;

        let summary = state.lock().summary();
        assert_eq!(summary.intervals_delivered, 3);
        assert_eq!(summary.delivery_attempts, 3);
    }

    #[tokio::test]
    async fn repeated_auth_rejection_aborts() {
        let (worker, state, control) = worker(403, 2);
        let (tx, rx) = mpsc::channel(4);
        for seq in 1..=4 {
            tx.send(snapshot(seq)).await.unwrap();
        }
        drop(tx);
        worker.run(rx).await;

        let summary = state.lock().summary();
        assert_eq!(summary.status, SessionStatus::AuthFailed);
        assert_eq!(summary.intervals_dropped, 2);
        assert_eq!(*control.borrow(), Control::Abort);
    }

    #[tokio::test]
    async fn encoding_failure_drops_interval() {
        let (worker, state, _control) = worker(202, 3);
        let mut bad = snapshot(1);
        bad.overall.avg_response_time = f64::NAN;

        assert!(!worker.process(&bad).await);
        let summary = state.lock().summary();
        assert_eq!(summary.intervals_dropped, 1);
        assert_eq!(summary.delivery_attempts, 0);
    }
}
