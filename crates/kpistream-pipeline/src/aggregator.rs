//! Interval aggregation.
//!
//! A single task owns the window buffer: it folds incoming samples, and on each
//! tick swaps the buffer for a fresh one and emits an `AggregateSnapshot`.
//! Session-to-date percentiles are kept in HDR histograms alongside.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kpistream_core::error::CoreError;
use kpistream_core::models::sample::Sample;
use kpistream_core::models::snapshot::{AggregateSnapshot, CumulativeKpis, KpiSet};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::percentile::{nearest_rank, CumulativeHistogram};
use crate::session::Control;
use crate::state::SharedState;

/// Running sums for one label (or the overall set) within a window
#[derive(Debug, Default)]
struct KpiAccumulator {
    response_times: Vec<f64>,
    success: u64,
    failures: u64,
    latency_sum: f64,
    latency_count: u64,
    connect_sum: f64,
    connect_count: u64,
    max_concurrency: u32,
    bytes_received: u64,
    bytes_sent: u64,
    response_codes: BTreeMap<String, u64>,
    errors: BTreeMap<String, u64>,
}

impl KpiAccumulator {
    fn add(&mut self, sample: &Sample) {
        self.response_times.push(sample.response_time);
        if sample.success {
            self.success += 1;
        } else {
            self.failures += 1;
            let message = sample.error_message.as_deref().unwrap_or("unknown error");
            *self.errors.entry(message.to_string()).or_default() += 1;
        }
        if let Some(latency) = sample.latency {
            self.latency_sum += latency;
            self.latency_count += 1;
        }
        if let Some(connect) = sample.connect_time {
            self.connect_sum += connect;
            self.connect_count += 1;
        }
        if let Some(threads) = sample.active_threads {
            self.max_concurrency = self.max_concurrency.max(threads);
        }
        self.bytes_received += sample.bytes_received.unwrap_or(0);
        self.bytes_sent += sample.bytes_sent.unwrap_or(0);
        if let Some(code) = &sample.response_code {
            *self.response_codes.entry(code.clone()).or_default() += 1;
        }
    }

    fn finish(mut self, ranks: &[f64]) -> KpiSet {
        let total = self.response_times.len() as u64;
        let avg_response_time = mean(self.response_times.iter().sum(), total);
        self.response_times.sort_by(f64::total_cmp);

        KpiSet {
            total,
            success: self.success,
            failures: self.failures,
            percentiles: nearest_rank(&self.response_times, ranks),
            avg_response_time,
            avg_latency: mean(self.latency_sum, self.latency_count),
            avg_connect_time: mean(self.connect_sum, self.connect_count),
            max_concurrency: self.max_concurrency,
            bytes_received: self.bytes_received,
            bytes_sent: self.bytes_sent,
            response_codes: self.response_codes,
            errors: self.errors,
        }
    }
}

fn mean(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Samples of the open window
#[derive(Debug, Default)]
struct WindowBuffer {
    overall: KpiAccumulator,
    labels: BTreeMap<String, KpiAccumulator>,
    rejected: u64,
}

impl WindowBuffer {
    fn is_empty(&self) -> bool {
        self.overall.response_times.is_empty()
    }
}

/// Window and session-to-date aggregation state.
pub struct Aggregator {
    ranks: Vec<f64>,
    tags: BTreeMap<String, String>,
    state: SharedState,
    window: WindowBuffer,
    window_start: DateTime<Utc>,
    sequence: u64,
    cumulative_overall: CumulativeHistogram,
    cumulative_labels: BTreeMap<String, CumulativeHistogram>,
}

impl Aggregator {
    pub fn new(
        ranks: Vec<f64>,
        tags: BTreeMap<String, String>,
        state: SharedState,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            ranks,
            tags,
            state,
            window: WindowBuffer::default(),
            window_start: Utc::now(),
            sequence: 0,
            cumulative_overall: CumulativeHistogram::new()?,
            cumulative_labels: BTreeMap::new(),
        })
    }

    /// Fold one sample into the open window, or reject it.
    pub fn accept(&mut self, sample: Sample) {
        if let Err(e) = sample.validate() {
            warn!("sample rejected: {e}");
            self.window.rejected += 1;
            self.state.lock().record_rejected(1);
            return;
        }

        self.window.overall.add(&sample);
        self.window
            .labels
            .entry(sample.label.clone())
            .or_default()
            .add(&sample);
        self.cumulative_overall.record(sample.response_time);

        match self.cumulative_labels.get_mut(&sample.label) {
            Some(hist) => hist.record(sample.response_time),
            None => match CumulativeHistogram::new() {
                Ok(mut hist) => {
                    hist.record(sample.response_time);
                    self.cumulative_labels.insert(sample.label.clone(), hist);
                }
                Err(e) => warn!("no cumulative table for {:?}: {e}", sample.label),
            },
        }
    }

    /// Close the open window and start a new one at `now`.
    ///
    /// Returns `None` when the window held no accepted samples.
    pub fn close_window(&mut self, now: DateTime<Utc>, is_final: bool) -> Option<AggregateSnapshot> {
        let window = std::mem::take(&mut self.window);
        let window_start = std::mem::replace(&mut self.window_start, now);

        if window.is_empty() {
            debug!(
                "empty window {}..{}, nothing to send ({} rejected)",
                window_start.format("%H:%M:%S"),
                now.format("%H:%M:%S"),
                window.rejected
            );
            return None;
        }

        self.sequence += 1;
        let ranks = &self.ranks;
        let snapshot = AggregateSnapshot {
            sequence: self.sequence,
            window_start,
            window_end: now,
            overall: window.overall.finish(ranks),
            labels: window
                .labels
                .into_iter()
                .map(|(label, acc)| (label, acc.finish(ranks)))
                .collect(),
            cumulative: CumulativeKpis {
                overall: self.cumulative_overall.table(ranks),
                labels: self
                    .cumulative_labels
                    .iter()
                    .map(|(label, hist)| (label.clone(), hist.table(ranks)))
                    .collect(),
            },
            rejected: window.rejected,
            tags: self.tags.clone(),
            is_final,
        };

        self.state.lock().record_snapshot(&snapshot);
        debug!(
            "snapshot #{} ({}): {} samples, {} labels, {} failures",
            snapshot.sequence,
            snapshot.window_display(),
            snapshot.overall.total,
            snapshot.labels.len(),
            snapshot.overall.failures
        );
        Some(snapshot)
    }

    /// Consume samples until drained or aborted.
    ///
    /// Regular snapshots go to `snapshots`. On `Control::Drain` the intake is
    /// closed, queued samples are folded in, and the final snapshot is returned
    /// instead of sent. On `Control::Abort` nothing more is emitted.
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<Sample>,
        interval: Duration,
        snapshots: mpsc::Sender<AggregateSnapshot>,
        mut control: watch::Receiver<Control>,
    ) -> Option<AggregateSnapshot> {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.window_start = Utc::now();
        info!("aggregating every {interval:?}");

        let mut signal = *control.borrow_and_update();
        while signal == Control::Run {
            tokio::select! {
                maybe = samples.recv() => match maybe {
                    Some(sample) => self.accept(sample),
                    None => {
                        debug!("all sample producers gone");
                        signal = Control::Drain;
                    }
                },
                _ = ticker.tick() => {
                    if let Some(snapshot) = self.close_window(Utc::now(), false) {
                        if snapshots.send(snapshot).await.is_err() {
                            debug!("delivery worker gone, stopping aggregation");
                            signal = Control::Abort;
                        }
                    }
                }
                changed = control.changed() => {
                    signal = match changed {
                        Ok(()) => *control.borrow_and_update(),
                        Err(_) => Control::Drain,
                    };
                }
            }
        }

        samples.close();
        if signal == Control::Abort {
            info!("aggregation aborted");
            return None;
        }

        let mut drained = 0usize;
        while let Some(sample) = samples.recv().await {
            self.accept(sample);
            drained += 1;
        }
        debug!("drained {drained} queued samples");
        self.close_window(Utc::now(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;
    use chrono::TimeZone;
    use kpistream_core::models::snapshot::DEFAULT_PERCENTILES;

    fn aggregator() -> (Aggregator, SharedState) {
        let state = SessionState::new("s", 3).shared();
        let tags: BTreeMap<String, String> = [("env".to_string(), "ci".to_string())].into();
        let agg = Aggregator::new(DEFAULT_PERCENTILES.to_vec(), tags, state.clone()).unwrap();
        (agg, state)
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, secs).unwrap()
    }

    #[test]
    fn reference_window_aggregates() {
        let (mut agg, state) = aggregator();
        let times = [0.98, 1.01, 1.01, 1.01, 1.01, 1.01, 1.01, 1.16, 1.21, 1.31];
        for (i, t) in times.iter().enumerate() {
            let mut sample = Sample::new("login", at(0), *t).with_response_code("200");
            if i == 9 {
                sample = sample.failed("timeout").with_response_code("504");
            }
            agg.accept(sample);
        }

        let snapshot = agg.close_window(at(5), false).unwrap();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.overall.total, 10);
        assert_eq!(snapshot.overall.success, 9);
        assert_eq!(snapshot.overall.failures, 1);
        assert_eq!(snapshot.overall.percentiles.get(50.0), Some(1.01));
        assert_eq!(snapshot.overall.percentiles.get(90.0), Some(1.21));
        assert_eq!(snapshot.overall.percentiles.get(100.0), Some(1.31));
        assert_eq!(snapshot.overall.response_codes["504"], 1);
        assert_eq!(snapshot.overall.errors["timeout"], 1);
        assert_eq!(snapshot.labels["login"], snapshot.overall);
        assert_eq!(snapshot.tags["env"], "ci");
        assert!(snapshot.cumulative.overall.is_monotonic());
        assert_eq!(state.lock().total_samples(), 10);
    }

    #[test]
    fn labels_are_split() {
        let (mut agg, _) = aggregator();
        agg.accept(Sample::new("a", at(0), 0.1).with_threads(5));
        agg.accept(Sample::new("b", at(0), 0.3).with_threads(9).with_timings(0.01, 0.2));
        agg.accept(Sample::new("a", at(1), 0.2).with_threads(7));

        let snapshot = agg.close_window(at(5), false).unwrap();
        assert_eq!(snapshot.labels.len(), 2);
        assert_eq!(snapshot.labels["a"].total, 2);
        assert_eq!(snapshot.labels["a"].max_concurrency, 7);
        assert_eq!(snapshot.labels["b"].avg_latency, 0.2);
        assert_eq!(snapshot.overall.max_concurrency, 9);
        assert_eq!(
            snapshot.labels.values().map(|k| k.total).sum::<u64>(),
            snapshot.overall.total
        );
        assert_eq!(snapshot.cumulative.labels.len(), 2);
    }

    #[test]
    fn single_sample_window() {
        let (mut agg, _) = aggregator();
        agg.accept(Sample::new("only", at(0), 0.5));
        let snapshot = agg.close_window(at(5), false).unwrap();
        assert!(snapshot
            .overall
            .percentiles
            .entries()
            .iter()
            .all(|e| e.value == 0.5));
    }

    #[test]
    fn empty_window_emits_nothing() {
        let (mut agg, _) = aggregator();
        assert!(agg.close_window(at(5), false).is_none());

        agg.accept(Sample::new("x", at(6), 0.1));
        let snapshot = agg.close_window(at(10), false).unwrap();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.window_start, at(5));
    }

    #[test]
    fn malformed_samples_are_counted_not_aggregated() {
        let (mut agg, state) = aggregator();
        agg.accept(Sample::new("ok", at(0), 0.1));
        agg.accept(Sample::new("bad", at(0), -1.0));
        agg.accept(Sample::new("", at(0), 0.1));

        let snapshot = agg.close_window(at(5), false).unwrap();
        assert_eq!(snapshot.overall.total, 1);
        assert_eq!(snapshot.rejected, 2);
        assert!(!snapshot.labels.contains_key("bad"));
        assert_eq!(state.lock().rejected_samples(), 2);
    }

    #[test]
    fn oversized_label_never_reaches_cumulative_tables() {
        let (mut agg, state) = aggregator();
        let long = "l".repeat(kpistream_core::models::sample::MAX_LABEL_LEN + 1);
        agg.accept(Sample::new("ok", at(0), 0.1));
        agg.accept(Sample::new(long.clone(), at(0), 0.1));
        let first = agg.close_window(at(5), false).unwrap();

        agg.accept(Sample::new("ok", at(6), 0.2));
        let second = agg.close_window(at(10), false).unwrap();

        assert_eq!(first.rejected, 1);
        assert!(!first.labels.contains_key(&long));
        assert!(!second.cumulative.labels.contains_key(&long));
        assert_eq!(state.lock().rejected_samples(), 1);
    }

    #[test]
    fn cumulative_spans_windows() {
        let (mut agg, _) = aggregator();
        agg.accept(Sample::new("x", at(0), 0.1));
        agg.close_window(at(5), false).unwrap();
        agg.accept(Sample::new("x", at(6), 2.0));
        let second = agg.close_window(at(10), false).unwrap();

        assert_eq!(second.overall.total, 1);
        let max = second.cumulative.overall.get(100.0).unwrap();
        let min = second.cumulative.overall.get(0.0).unwrap();
        assert!((max - 2.0).abs() < 0.01);
        assert!((min - 0.1).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn run_emits_on_tick_and_returns_final_on_drain() {
        let (agg, state) = aggregator();
        let (sample_tx, sample_rx) = mpsc::channel(16);
        let (snap_tx, mut snap_rx) = mpsc::channel(4);
        let (control_tx, control_rx) = watch::channel(Control::Run);

        let task = tokio::spawn(agg.run(sample_rx, Duration::from_secs(5), snap_tx, control_rx));

        sample_tx.send(Sample::new("a", Utc::now(), 0.1)).await.unwrap();
        let first = snap_rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert!(!first.is_final);

        sample_tx.send(Sample::new("a", Utc::now(), 0.2)).await.unwrap();
        sample_tx.send(Sample::new("a", Utc::now(), 0.3)).await.unwrap();
        tokio::task::yield_now().await;
        control_tx.send_replace(Control::Drain);

        let last = task.await.unwrap().unwrap();
        assert!(last.is_final);
        assert_eq!(last.overall.total, 2);
        assert_eq!(state.lock().total_samples(), 3);
        assert!(sample_tx.send(Sample::new("a", Utc::now(), 0.1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_returns_nothing() {
        let (agg, _) = aggregator();
        let (sample_tx, sample_rx) = mpsc::channel(16);
        let (snap_tx, _snap_rx) = mpsc::channel(4);
        let (control_tx, control_rx) = watch::channel(Control::Run);

        let task = tokio::spawn(agg.run(sample_rx, Duration::from_secs(5), snap_tx, control_rx));
        sample_tx.send(Sample::new("a", Utc::now(), 0.1)).await.unwrap();
        control_tx.send_replace(Control::Abort);

        assert!(task.await.unwrap().is_none());
    }
}
