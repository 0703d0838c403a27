//! Metric API payload encoder.
//!
//! Turns an `AggregateSnapshot` into the gauge batch format accepted by the
//! Metric API. Pure and deterministic: the same snapshot, credential and tags
//! always produce the same bytes.

use std::collections::BTreeMap;

use kpistream_core::credential::Credential;
use kpistream_core::error::CoreError;
use kpistream_core::models::delivery::EncodedPayload;
use kpistream_core::models::snapshot::{rank_key, AggregateSnapshot, KpiSet, PercentileTable};
use serde::Serialize;
use tracing::debug;

/// Label attribute used for the all-labels aggregate
pub const OVERALL_LABEL: &str = "OVERALL";

/// Attribute name limit enforced by the Metric API
const MAX_ATTRIBUTE_KEY_LEN: usize = 255;

/// Attribute value limit enforced by the Metric API
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 4096;

/// Seconds to milliseconds
pub const DEFAULT_TIMES_MULTIPLIER: f64 = 1000.0;

#[derive(Serialize)]
struct MetricBatch<'a> {
    common: Common<'a>,
    metrics: &'a [GaugeMetric],
}

#[derive(Serialize)]
struct Common<'a> {
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct GaugeMetric {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    value: f64,
    timestamp: i64,
    attributes: BTreeMap<&'static str, String>,
}

/// Encoder bound to one session's identity
#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    project: String,
    session_id: String,
    account_id: Option<String>,
    times_multiplier: f64,
}

impl PayloadEncoder {
    pub fn new(project: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            session_id: session_id.into(),
            account_id: None,
            times_multiplier: DEFAULT_TIMES_MULTIPLIER,
        }
    }

    pub fn with_account_id(mut self, account_id: Option<String>) -> Self {
        self.account_id = account_id;
        self
    }

    /// Factor applied to every reported time (samples carry seconds).
    pub fn with_times_multiplier(mut self, multiplier: f64) -> Self {
        self.times_multiplier = multiplier;
        self
    }

    /// Encode one snapshot.
    ///
    /// Custom `tags` go into the common attribute block so they apply to every
    /// metric. Fails with `CoreError::Encoding` on invalid tags or non-finite values.
    pub fn encode(
        &self,
        snapshot: &AggregateSnapshot,
        credential: &Credential,
        tags: &BTreeMap<String, String>,
    ) -> Result<EncodedPayload, CoreError> {
        let common = self.common_attributes(tags)?;
        let timestamp = snapshot.window_end.timestamp_millis();
        let window_secs = (snapshot.window_end - snapshot.window_start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let multi = self.times_multiplier;
        let mut metrics = Vec::new();
        push_current(
            &mut metrics,
            OVERALL_LABEL,
            &snapshot.overall,
            window_secs,
            multi,
            timestamp,
        )?;
        for (label, kpi) in &snapshot.labels {
            check_value_len("label", label)?;
            push_current(&mut metrics, label, kpi, window_secs, multi, timestamp)?;
        }
        push_cumulative(
            &mut metrics,
            OVERALL_LABEL,
            &snapshot.cumulative.overall,
            multi,
            timestamp,
        )?;
        for (label, table) in &snapshot.cumulative.labels {
            check_value_len("label", label)?;
            push_cumulative(&mut metrics, label, table, multi, timestamp)?;
        }

        let body = serialize_batch(&common, metrics.as_slice())?;
        debug!(
            "encoded snapshot #{} ({}): {} metrics, {} bytes",
            snapshot.sequence,
            snapshot.window_display(),
            metrics.len(),
            body.len()
        );

        Ok(EncodedPayload {
            sequence: snapshot.sequence,
            window: snapshot.window_display(),
            body,
            metric_count: metrics.len(),
            credential: credential.clone(),
            is_final: snapshot.is_final,
        })
    }

    /// A batch with no metrics, used to check connectivity and auth at startup.
    pub fn encode_empty(
        &self,
        credential: &Credential,
        tags: &BTreeMap<String, String>,
    ) -> Result<EncodedPayload, CoreError> {
        let common = self.common_attributes(tags)?;
        let body = serialize_batch(&common, &[])?;
        Ok(EncodedPayload {
            sequence: 0,
            window: "preflight".to_string(),
            body,
            metric_count: 0,
            credential: credential.clone(),
            is_final: false,
        })
    }

    fn common_attributes(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, CoreError> {
        let mut attributes = BTreeMap::new();
        attributes.insert("project".to_string(), self.project.clone());
        attributes.insert("id".to_string(), self.session_id.clone());
        if let Some(account_id) = &self.account_id {
            attributes.insert("account.id".to_string(), account_id.clone());
        }
        for (key, value) in tags {
            check_key(key)?;
            check_value_len(key, value)?;
            attributes.insert(key.clone(), value.clone());
        }
        Ok(attributes)
    }
}

fn serialize_batch(
    common: &BTreeMap<String, String>,
    metrics: &[GaugeMetric],
) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(&[MetricBatch {
        common: Common { attributes: common },
        metrics,
    }])
    .map_err(|e| CoreError::Encoding(format!("serialization failed: {e}")))
}

fn push_current(
    out: &mut Vec<GaugeMetric>,
    label: &str,
    kpi: &KpiSet,
    window_secs: f64,
    multi: f64,
    timestamp: i64,
) -> Result<(), CoreError> {
    let throughput = if window_secs > 0.0 {
        kpi.total as f64 / window_secs
    } else {
        kpi.total as f64
    };
    let min = kpi.percentiles.get(0.0).unwrap_or(0.0);
    let max = kpi.percentiles.get(100.0).unwrap_or(0.0);

    let gauges = [
        ("bztRPS", throughput),
        ("bztSamples", kpi.total as f64),
        ("bztThreads", kpi.max_concurrency as f64),
        ("bztFailures", kpi.failures as f64),
        ("bztmin", min * multi),
        ("bztmax", max * multi),
        ("bztavg", kpi.avg_response_time * multi),
        ("bztlat", kpi.avg_latency * multi),
        ("bztconn", kpi.avg_connect_time * multi),
    ];
    for (name, value) in gauges {
        out.push(gauge(name.to_string(), value, label, timestamp)?);
    }

    for entry in kpi.percentiles.entries() {
        let name = format!("bztp{}", rank_key(entry.rank));
        out.push(gauge(name, entry.value * multi, label, timestamp)?);
    }

    for (code, count) in &kpi.response_codes {
        check_value_len("rc", code)?;
        let mut metric = gauge("bztcode".to_string(), *count as f64, label, timestamp)?;
        metric.attributes.insert("rc", code.clone());
        out.push(metric);
    }
    Ok(())
}

fn push_cumulative(
    out: &mut Vec<GaugeMetric>,
    label: &str,
    table: &PercentileTable,
    multi: f64,
    timestamp: i64,
) -> Result<(), CoreError> {
    for entry in table.entries() {
        let name = format!("bztpc{}", rank_key(entry.rank));
        out.push(gauge(name, entry.value * multi, label, timestamp)?);
    }
    Ok(())
}

fn gauge(name: String, value: f64, label: &str, timestamp: i64) -> Result<GaugeMetric, CoreError> {
    if !value.is_finite() {
        return Err(CoreError::Encoding(format!(
            "metric {name} for label {label:?} has non-finite value {value}"
        )));
    }
    let mut attributes = BTreeMap::new();
    attributes.insert("label", label.to_string());
    Ok(GaugeMetric {
        name,
        kind: "gauge",
        value,
        timestamp,
        attributes,
    })
}

fn check_key(key: &str) -> Result<(), CoreError> {
    if key.trim().is_empty() {
        return Err(CoreError::Encoding("empty attribute name".to_string()));
    }
    if key.len() > MAX_ATTRIBUTE_KEY_LEN {
        return Err(CoreError::Encoding(format!(
            "attribute name longer than {MAX_ATTRIBUTE_KEY_LEN} bytes: {}...",
            &key[..key.char_indices().nth(32).map(|(i, _)| i).unwrap_or(key.len())]
        )));
    }
    Ok(())
}

fn check_value_len(key: &str, value: &str) -> Result<(), CoreError> {
    if value.len() > MAX_ATTRIBUTE_VALUE_LEN {
        return Err(CoreError::Encoding(format!(
            "attribute {key:?} value longer than {MAX_ATTRIBUTE_VALUE_LEN} bytes"
        )));
    }
    Ok(())
}
