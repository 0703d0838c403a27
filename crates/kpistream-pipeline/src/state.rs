//! Shared session state.
//!
//! Written by the aggregator and the delivery worker, read by the controller.
//! Every change goes through a method so the counters stay consistent.

use std::sync::Arc;

use kpistream_core::models::delivery::DeliveryResult;
use kpistream_core::models::session::{SessionPhase, SessionStatus, SessionSummary};
use kpistream_core::models::snapshot::AggregateSnapshot;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

pub type SharedState = Arc<Mutex<SessionState>>;

/// Cumulative counters for one reporting session
#[derive(Debug, Clone)]
pub struct SessionState {
    session_id: String,
    phase: SessionPhase,
    status: SessionStatus,
    total_samples: u64,
    failed_samples: u64,
    rejected_samples: u64,
    intervals_emitted: u64,
    intervals_delivered: u64,
    intervals_dropped: u64,
    delivery_attempts: u64,
    consecutive_auth_failures: u32,
    auth_failure_threshold: u32,
    dashboard_link: String,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, auth_failure_threshold: u32) -> Self {
        Self {
            session_id: session_id.into(),
            phase: SessionPhase::Idle,
            status: SessionStatus::Active,
            total_samples: 0,
            failed_samples: 0,
            rejected_samples: 0,
            intervals_emitted: 0,
            intervals_delivered: 0,
            intervals_dropped: 0,
            delivery_attempts: 0,
            consecutive_auth_failures: 0,
            auth_failure_threshold: auth_failure_threshold.max(1),
            dashboard_link: String::new(),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn dashboard_link(&self) -> &str {
        &self.dashboard_link
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn rejected_samples(&self) -> u64 {
        self.rejected_samples
    }

    pub fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!("session {} phase {} -> {phase}", self.session_id, self.phase);
            self.phase = phase;
        }
    }

    pub fn set_dashboard_link(&mut self, link: impl Into<String>) {
        self.dashboard_link = link.into();
    }

    /// Terminal status; the first one set wins.
    pub fn finish(&mut self, status: SessionStatus) {
        if self.status == SessionStatus::Active {
            self.status = status;
        }
        self.phase = SessionPhase::Stopped;
    }

    /// Count the samples folded into an emitted snapshot.
    pub fn record_snapshot(&mut self, snapshot: &AggregateSnapshot) {
        self.intervals_emitted += 1;
        self.total_samples += snapshot.overall.total;
        self.failed_samples += snapshot.overall.failures;
    }

    /// Count emitted intervals that never got a delivery result as dropped.
    ///
    /// Only meaningful once the aggregator and the worker have stopped.
    pub fn drop_unsettled(&mut self, reason: &str) -> u64 {
        let settled = self.intervals_delivered + self.intervals_dropped;
        let lost = self.intervals_emitted.saturating_sub(settled);
        if lost > 0 {
            warn!("{lost} interval(s) never delivered: {reason}");
            self.intervals_dropped += lost;
        }
        lost
    }

    /// Count samples rejected for data quality.
    pub fn record_rejected(&mut self, count: u64) {
        self.rejected_samples += count;
    }

    /// Apply a delivery result.
    ///
    /// Returns `true` once consecutive auth rejections reach the threshold.
    pub fn record_delivery(&mut self, result: &DeliveryResult) -> bool {
        match result {
            DeliveryResult::Delivered { attempts } => {
                self.intervals_delivered += 1;
                self.delivery_attempts += u64::from(*attempts);
                self.consecutive_auth_failures = 0;
            }
            DeliveryResult::Dropped { attempts, .. } => {
                self.intervals_dropped += 1;
                self.delivery_attempts += u64::from(*attempts);
            }
            DeliveryResult::Rejected { auth, .. } => {
                self.intervals_dropped += 1;
                self.delivery_attempts += 1;
                if *auth {
                    self.consecutive_auth_failures += 1;
                } else {
                    self.consecutive_auth_failures = 0;
                }
            }
        }

        let exhausted = self.consecutive_auth_failures >= self.auth_failure_threshold;
        if exhausted {
            error!(
                "{} consecutive authentication rejections, aborting session {}",
                self.consecutive_auth_failures, self.session_id
            );
        }
        exhausted
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            total_samples: self.total_samples,
            failed_samples: self.failed_samples,
            rejected_samples: self.rejected_samples,
            intervals_delivered: self.intervals_delivered,
            intervals_dropped: self.intervals_dropped,
            delivery_attempts: self.delivery_attempts,
            dashboard_link: self.dashboard_link.clone(),
        }
    }
}
