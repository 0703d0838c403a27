//! Delivery attempt observer port.

use crate::models::delivery::DeliveryAttempt;

/// Receives one record per delivery try
pub trait AttemptSink: Send + Sync {
    fn record(&self, attempt: &DeliveryAttempt);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAttemptSink;

impl AttemptSink for NoopAttemptSink {
    fn record(&self, _attempt: &DeliveryAttempt) {}
}
