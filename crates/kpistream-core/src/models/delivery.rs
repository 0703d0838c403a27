//! Delivery models.
//!
//! Encoded payloads and the record of each attempt to ship them.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::credential::Credential;

/// A snapshot serialized into the ingestion API's wire format.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    /// Sequence of the snapshot this payload was built from (0 for preflight)
    pub sequence: u64,
    /// Human-readable window, for log context
    pub window: String,
    /// Uncompressed JSON body
    pub body: Vec<u8>,
    pub metric_count: usize,
    /// Credential for the auth header
    pub credential: Credential,
    pub is_final: bool,
}

/// Outcome of one HTTP exchange, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResponse {
    pub status: u16,
    pub body: String,
    /// Parsed `Retry-After` header, seconds
    pub retry_after_secs: Option<u64>,
}

/// Classification of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::TransientFailure => write!(f, "transient-failure"),
            AttemptOutcome::FatalFailure => write!(f, "fatal-failure"),
        }
    }
}

/// One outbound transmission of a payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryAttempt {
    /// Target snapshot sequence
    pub sequence: u64,
    /// 1-based attempt number
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// HTTP status, absent on network errors
    pub status: Option<u16>,
    #[serde(with = "millis")]
    pub latency: Duration,
}

/// Final result of delivering one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Accepted by the API
    Delivered { attempts: u32 },
    /// Transient failures exhausted the retry budget
    Dropped { reason: String, attempts: u32 },
    /// Fatal 4xx; `auth` is set for 401/403
    Rejected { status: u16, auth: bool },
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered { .. })
    }

    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, DeliveryResult::Rejected { auth: true, .. })
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
