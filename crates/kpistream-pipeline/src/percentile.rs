//! Percentile math.
//!
//! Window percentiles are exact nearest-rank over the window's response times.
//! Session-to-date percentiles come from an HDR histogram, which keeps memory
//! flat no matter how long the test runs.

use hdrhistogram::Histogram;
use kpistream_core::error::CoreError;
use kpistream_core::models::snapshot::{PercentileEntry, PercentileTable};

/// HDR range: 1µs to 1h, 3 significant figures
const HIST_LOW_US: u64 = 1;
const HIST_HIGH_US: u64 = 3_600_000_000;
const HIST_SIGFIG: u8 = 3;

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Nearest-rank percentile table over `sorted` (ascending).
///
/// rank `p` picks element `ceil(p/100 * n)` (1-based, clamped to `[1, n]`);
/// `p = 0` is the minimum. Empty input gives an empty table.
pub fn nearest_rank(sorted: &[f64], ranks: &[f64]) -> PercentileTable {
    if sorted.is_empty() {
        return PercentileTable::default();
    }
    let n = sorted.len();
    let entries = ranks
        .iter()
        .map(|&rank| PercentileEntry {
            rank,
            value: sorted[nearest_rank_index(rank, n)],
        })
        .collect();
    PercentileTable::new(entries)
}

/// 0-based index picked by nearest-rank for `rank` over `n` values.
fn nearest_rank_index(rank: f64, n: usize) -> usize {
    if rank <= 0.0 {
        return 0;
    }
    // p * n / 100 keeps exact products exact (99.9 * 1000 / 100 == 999)
    let position = (rank * n as f64 / 100.0 - 1e-9).ceil();
    let position = position.clamp(1.0, n as f64) as usize;
    position - 1
}

/// Session-to-date response time distribution.
#[derive(Debug, Clone)]
pub struct CumulativeHistogram {
    hist: Histogram<u64>,
}

impl CumulativeHistogram {
    pub fn new() -> Result<Self, CoreError> {
        let hist = Histogram::new_with_bounds(HIST_LOW_US, HIST_HIGH_US, HIST_SIGFIG)
            .map_err(|e| CoreError::Internal(format!("histogram creation failed: {e:?}")))?;
        Ok(Self { hist })
    }

    /// Record a response time in seconds; values past one hour saturate.
    pub fn record(&mut self, secs: f64) {
        let micros = (secs * MICROS_PER_SEC).round().max(0.0) as u64;
        self.hist.saturating_record(micros);
    }

    pub fn len(&self) -> u64 {
        self.hist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hist.len() == 0
    }

    /// Percentile table in seconds for `ranks`.
    pub fn table(&self, ranks: &[f64]) -> PercentileTable {
        if self.hist.len() == 0 {
            return PercentileTable::default();
        }
        let entries = ranks
            .iter()
            .map(|&rank| {
                let micros = if rank <= 0.0 {
                    self.hist.min()
                } else if rank >= 100.0 {
                    self.hist.max()
                } else {
                    self.hist.value_at_percentile(rank)
                };
                PercentileEntry {
                    rank,
                    value: micros as f64 / MICROS_PER_SEC,
                }
            })
            .collect();
        PercentileTable::new(entries)
    }
}
