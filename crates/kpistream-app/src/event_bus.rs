//! Internal event bus.
//!
//! `tokio::broadcast` fan-out of session events. The bus doubles as the
//! pipeline's `AttemptSink`, so every delivery try shows up here.

use kpistream_core::models::delivery::{AttemptOutcome, DeliveryAttempt};
use kpistream_core::models::session::SessionSummary;
use kpistream_core::ports::attempt_sink::AttemptSink;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum ReporterEvent {
    Started { session_id: String, dashboard_link: String },
    Attempt(DeliveryAttempt),
    Stopped(SessionSummary),
}

pub struct EventBus {
    tx: broadcast::Sender<ReporterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ReporterEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReporterEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl AttemptSink for EventBus {
    fn record(&self, attempt: &DeliveryAttempt) {
        self.publish(ReporterEvent::Attempt(attempt.clone()));
    }
}

/// Log every event until the bus closes or a `Stopped` arrives.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ReporterEvent::Started {
                    session_id,
                    dashboard_link,
                }) => info!("session {session_id} started, dashboard: {dashboard_link}"),
                Ok(ReporterEvent::Attempt(attempt)) => match attempt.outcome {
                    AttemptOutcome::Success => debug!(
                        "#{} attempt {} ok in {:?}",
                        attempt.sequence, attempt.attempt, attempt.latency
                    ),
                    outcome => debug!(
                        "#{} attempt {} {outcome} (status {:?}) in {:?}",
                        attempt.sequence, attempt.attempt, attempt.status, attempt.latency
                    ),
                },
                Ok(ReporterEvent::Stopped(summary)) => {
                    debug!("session {} stopped: {:?}", summary.session_id, summary.status);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("event logger lagged by {n}"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
