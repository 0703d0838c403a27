//! Core error type.
//!
//! Every adapter crate returns `CoreError` directly; the binary wraps it in `anyhow`.

use thiserror::Error;

/// Core layer errors.
///
/// Variants follow the reporter's propagation policy: data quality and encoding
/// errors are absorbed per sample / per interval, delivery errors are classified
/// for the retry loop, credential errors end the session.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No credential source produced a value
    #[error("credential missing: {0}")]
    CredentialMissing(String),

    /// Malformed sample, rejected before aggregation
    #[error("data quality error for label {label:?}: {reason}")]
    DataQuality {
        /// Sample label (may be empty when that is the problem)
        label: String,
        /// Why the sample was rejected
        reason: String,
    },

    /// Snapshot could not be turned into a wire payload
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Retryable delivery failure (429, 5xx)
    #[error("transient delivery error (status {status}): {message}")]
    TransientDelivery {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
        /// Server-requested wait in seconds, if any
        retry_after_secs: Option<u64>,
    },

    /// Non-retryable delivery failure (4xx other than 429)
    #[error("fatal delivery error (status {status}): {message}")]
    FatalDelivery {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Authentication rejected by the ingestion API (401/403)
    #[error("delivery authentication rejected (status {status})")]
    AuthDelivery {
        /// HTTP status code
        status: u16,
    },

    /// Network error (connect failure, timeout)
    #[error("network error: {0}")]
    Network(String),

    /// Configuration value error
    #[error("config error: {0}")]
    Config(String),

    /// Field validation failure
    #[error("validation failed, {field}: {message}")]
    Validation {
        /// Offending field
        field: String,
        /// Reason
        message: String,
    },

    /// Intake is closed because the session is draining or stopped
    #[error("sample intake is closed")]
    IntakeClosed,

    /// Bounded wait on a full intake queue elapsed
    #[error("sample queue still full after {waited_ms}ms")]
    QueueTimeout {
        /// How long the producer waited
        waited_ms: u64,
    },

    /// JSON serialization/deserialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the delivery loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientDelivery { .. } | CoreError::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CoreError::Network("timeout".to_string()).is_retryable());
        assert!(CoreError::TransientDelivery {
            status: 503,
            message: String::new(),
            retry_after_secs: None,
        }
        .is_retryable());
        assert!(!CoreError::AuthDelivery { status: 401 }.is_retryable());
        assert!(!CoreError::FatalDelivery {
            status: 400,
            message: "bad".to_string(),
        }
        .is_retryable());
        assert!(!CoreError::Encoding("nan".to_string()).is_retryable());
    }

    #[test]
    fn data_quality_message_names_label() {
        let err = CoreError::DataQuality {
            label: "login".to_string(),
            reason: "negative response time".to_string(),
        };
        assert!(err.to_string().contains("login"));
        assert!(err.to_string().contains("negative"));
    }
}
