//! Dashboard provider port.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Source of the dashboard link reported to the user
#[async_trait]
pub trait DashboardProvider: Send + Sync {
    /// Link to the dashboard for `project`, creating it if the provider can.
    async fn dashboard_link(&self, project: &str) -> Result<String, CoreError>;

    /// Save a static report of the dashboard for the given time range.
    ///
    /// Returns the written file, or `None` when the provider has no reports.
    async fn static_report(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, CoreError> {
        Ok(None)
    }
}
