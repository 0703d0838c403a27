//! Sample model.
//!
//! One measured request outcome as reported by the test engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A single measured request outcome.
///
/// Times are in seconds, matching what load test engines report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Request type identifier
    #[serde(default)]
    pub label: String,
    /// When the request started
    pub timestamp: DateTime<Utc>,
    /// Full response time in seconds
    pub response_time: f64,
    /// Whether the request succeeded
    #[serde(default = "default_success")]
    pub success: bool,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Protocol response code ("200", "503", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    /// Connect time in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<f64>,
    /// Time to first byte in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    /// Active virtual users when the sample completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_threads: Option<u32>,
}

/// Longest label the ingestion API accepts as an attribute value
pub const MAX_LABEL_LEN: usize = 4096;

fn default_success() -> bool {
    true
}

impl Sample {
    /// Minimal successful sample.
    pub fn new(label: impl Into<String>, timestamp: DateTime<Utc>, response_time: f64) -> Self {
        Self {
            label: label.into(),
            timestamp,
            response_time,
            success: true,
            error_message: None,
            response_code: None,
            bytes_received: None,
            bytes_sent: None,
            connect_time: None,
            latency: None,
            active_threads: None,
        }
    }

    /// Mark as failed with a message.
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    pub fn with_response_code(mut self, code: impl Into<String>) -> Self {
        self.response_code = Some(code.into());
        self
    }

    pub fn with_timings(mut self, connect_time: f64, latency: f64) -> Self {
        self.connect_time = Some(connect_time);
        self.latency = Some(latency);
        self
    }

    pub fn with_threads(mut self, active_threads: u32) -> Self {
        self.active_threads = Some(active_threads);
        self
    }

    /// Check the sample can be merged into statistics.
    ///
    /// Returns `CoreError::DataQuality` for a missing label, a negative or
    /// non-finite response time, or a negative / non-finite sub-timing.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.label.trim().is_empty() {
            return Err(self.reject("missing label"));
        }
        if self.label.len() > MAX_LABEL_LEN {
            return Err(self.reject(format!(
                "label longer than {MAX_LABEL_LEN} bytes ({})",
                self.label.len()
            )));
        }
        check_duration(self, "response time", self.response_time)?;
        if let Some(connect) = self.connect_time {
            check_duration(self, "connect time", connect)?;
        }
        if let Some(latency) = self.latency {
            check_duration(self, "latency", latency)?;
        }
        Ok(())
    }

    fn reject(&self, reason: impl Into<String>) -> CoreError {
        CoreError::DataQuality {
            label: self.label.clone(),
            reason: reason.into(),
        }
    }
}

fn check_duration(sample: &Sample, what: &str, value: f64) -> Result<(), CoreError> {
    if !value.is_finite() {
        return Err(sample.reject(format!("{what} is not a finite number")));
    }
    if value < 0.0 {
        return Err(sample.reject(format!("negative {what}: {value}")));
    }
    Ok(())
}
