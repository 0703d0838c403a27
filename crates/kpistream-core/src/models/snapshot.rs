//! Aggregate snapshot model.
//!
//! The immutable result of folding one interval window of samples.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default percentile ranks reported for every window.
pub const DEFAULT_PERCENTILES: [f64; 7] = [0.0, 50.0, 90.0, 95.0, 99.0, 99.9, 100.0];

/// Render a percentile rank as a metric key ("50.0", "99.9", "100.0").
pub fn rank_key(rank: f64) -> String {
    format!("{rank:.1}")
}

/// One percentile value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileEntry {
    /// Rank in [0, 100]
    pub rank: f64,
    /// Value in seconds
    pub value: f64,
}

/// Percentile values ordered by rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileTable {
    entries: Vec<PercentileEntry>,
}

impl PercentileTable {
    pub fn new(mut entries: Vec<PercentileEntry>) -> Self {
        entries.sort_by(|a, b| a.rank.total_cmp(&b.rank));
        Self { entries }
    }

    pub fn entries(&self) -> &[PercentileEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value at an exact configured rank.
    pub fn get(&self, rank: f64) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| (e.rank - rank).abs() < f64::EPSILON)
            .map(|e| e.value)
    }

    /// True when values never decrease as rank grows.
    pub fn is_monotonic(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].value <= w[1].value)
    }
}

/// Aggregate statistics for one group of samples (overall or one label).
///
/// `success + failures == total` holds by construction in the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiSet {
    pub total: u64,
    pub success: u64,
    pub failures: u64,
    /// Response time percentiles (seconds)
    pub percentiles: PercentileTable,
    /// Mean response time (seconds)
    pub avg_response_time: f64,
    /// Mean latency over samples that reported it (seconds)
    pub avg_latency: f64,
    /// Mean connect time over samples that reported it (seconds)
    pub avg_connect_time: f64,
    /// Highest active thread count seen
    pub max_concurrency: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Response code → count
    pub response_codes: BTreeMap<String, u64>,
    /// Error message → count
    pub errors: BTreeMap<String, u64>,
}

impl KpiSet {
    /// Failure ratio in percent; 0 for an empty set.
    pub fn failure_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.failures as f64 * 100.0 / self.total as f64
    }
}

/// Session-to-date percentiles, overall and per label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeKpis {
    pub overall: PercentileTable,
    pub labels: BTreeMap<String, PercentileTable>,
}

/// Immutable aggregate of one interval window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Monotonic per session, starting at 1
    pub sequence: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub overall: KpiSet,
    /// Per-label aggregates, keyed by label
    pub labels: BTreeMap<String, KpiSet>,
    pub cumulative: CumulativeKpis,
    /// Samples rejected for data quality within the window
    pub rejected: u64,
    /// Session-wide custom tags
    pub tags: BTreeMap<String, String>,
    /// Last snapshot of the session (flushed on drain)
    pub is_final: bool,
}

impl AggregateSnapshot {
    /// Window as "start..end" for log lines.
    pub fn window_display(&self) -> String {
        format!(
            "{}..{}",
            self.window_start.format("%H:%M:%S%.3f"),
            self.window_end.format("%H:%M:%S%.3f")
        )
    }
}
