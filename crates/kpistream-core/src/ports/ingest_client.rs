//! Ingestion API client port.
//!
//! Implementation: `kpistream-network` (reqwest).

use async_trait::async_trait;

use crate::error::CoreError;
use crate::models::delivery::{EncodedPayload, IngestResponse};

/// Transport to the remote ingestion endpoint
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Post one payload.
    ///
    /// Any HTTP response, including error statuses, is `Ok`; classification is
    /// the caller's job. Connection failures and timeouts are `CoreError::Network`.
    async fn post(&self, payload: &EncodedPayload) -> Result<IngestResponse, CoreError>;
}
