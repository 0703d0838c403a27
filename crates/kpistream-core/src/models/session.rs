//! Session models.
//!
//! Lifecycle phase and the summary handed to the host at the end.

use std::fmt;

use serde::Serialize;

/// Session controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "Idle"),
            SessionPhase::Starting => write!(f, "Starting"),
            SessionPhase::Running => write!(f, "Running"),
            SessionPhase::Draining => write!(f, "Draining"),
            SessionPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// How the session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Still running
    Active,
    /// Drained normally
    Completed,
    /// Aborted after repeated authentication rejections
    AuthFailed,
    /// Never started: no credential resolved
    CredentialMissing,
}

/// Cumulative totals exposed when the session stops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_samples: u64,
    pub failed_samples: u64,
    pub rejected_samples: u64,
    pub intervals_delivered: u64,
    pub intervals_dropped: u64,
    pub delivery_attempts: u64,
    pub dashboard_link: String,
}

impl SessionSummary {
    /// Failed samples as percent of aggregated samples.
    pub fn failure_percent(&self) -> f64 {
        if self.total_samples == 0 {
            return 0.0;
        }
        self.failed_samples as f64 * 100.0 / self.total_samples as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_percent_of_empty_session() {
        let summary = SessionSummary {
            session_id: "s".to_string(),
            status: SessionStatus::Completed,
            total_samples: 0,
            failed_samples: 0,
            rejected_samples: 0,
            intervals_delivered: 0,
            intervals_dropped: 0,
            delivery_attempts: 0,
            dashboard_link: String::new(),
        };
        assert_eq!(summary.failure_percent(), 0.0);
    }

    #[test]
    fn phase_display() {
        assert_eq!(SessionPhase::Draining.to_string(), "Draining");
    }
}
