//! Reporter configuration.
//!
//! Ingestion target, send cadence, credential sources, retry policy and dashboard
//! settings. Loaded from a YAML/TOML/JSON file through the `config` crate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;
use crate::models::snapshot::DEFAULT_PERCENTILES;

/// Default Metric API ingestion endpoint (US region)
pub const DEFAULT_ENDPOINT: &str = "https://metric-api.newrelic.com/metric/v1";

/// Default NerdGraph endpoint used for dashboard management
pub const DEFAULT_API_ENDPOINT: &str = "https://api.newrelic.com/graphql";

/// When to open the dashboard link in a browser
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserOpen {
    Start,
    End,
    Both,
    #[default]
    None,
}

impl BrowserOpen {
    pub fn at_start(self) -> bool {
        matches!(self, BrowserOpen::Start | BrowserOpen::Both)
    }

    pub fn at_end(self) -> bool {
        matches!(self, BrowserOpen::End | BrowserOpen::Both)
    }
}

impl std::str::FromStr for BrowserOpen {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(BrowserOpen::Start),
            "end" => Ok(BrowserOpen::End),
            "both" => Ok(BrowserOpen::Both),
            "none" | "" => Ok(BrowserOpen::None),
            other => Err(CoreError::Validation {
                field: "browser-open".to_string(),
                message: format!("expected start|end|both|none, got {other:?}"),
            }),
        }
    }
}

/// Delivery retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Total tries per payload, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait before the second try; doubles each time
    #[serde(default = "default_base_backoff", with = "duration_str")]
    pub base_backoff: Duration,
    /// Upper bound for any single wait
    #[serde(default = "default_max_backoff", with = "duration_str")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

/// Top-level reporter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReporterConfig {
    /// Project name, tagged on every metric
    pub project: String,
    /// Fallback dashboard link reported to the user
    pub dashboard_url: String,
    /// Aggregation window length
    #[serde(default = "default_send_interval", with = "duration_str")]
    pub send_interval: Duration,
    /// Literal insert key
    #[serde(default)]
    pub token: Option<String>,
    /// File holding the insert key
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    /// Extra attributes merged into every metric
    #[serde(default)]
    pub custom_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub browser_open: BrowserOpen,
    /// Per-request network timeout
    #[serde(default = "default_timeout", with = "duration_str")]
    pub timeout: Duration,
    /// Metric API endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Percentile ranks reported per window
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
    /// Factor applied to reported times; samples carry seconds, 1000 reports ms
    #[serde(default = "default_report_times_multiplier")]
    pub report_times_multiplier: f64,
    /// Intake queue bound; producers wait when it is full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Snapshots waiting for the delivery worker
    #[serde(default = "default_pending_snapshots")]
    pub pending_snapshots: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Consecutive auth rejections before the session aborts
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u32,
    /// Bound on the final flush at drain
    #[serde(default = "default_final_flush_timeout", with = "duration_str")]
    pub final_flush_timeout: Duration,
    /// Post an empty batch at startup to check connectivity and auth
    #[serde(default = "default_true")]
    pub preflight: bool,
    /// gzip request bodies
    #[serde(default = "default_true")]
    pub compress: bool,

    // dashboard manager
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub api_token_file: Option<PathBuf>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    #[serde(default)]
    pub dashboard_template_path: Option<PathBuf>,
    /// Download a PDF snapshot of the dashboard at the end
    #[serde(default)]
    pub static_report: bool,
}

impl ReporterConfig {
    /// Minimal configuration with every optional field at its default.
    pub fn new(project: impl Into<String>, dashboard_url: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dashboard_url: dashboard_url.into(),
            send_interval: default_send_interval(),
            token: None,
            token_file: None,
            custom_tags: BTreeMap::new(),
            browser_open: BrowserOpen::None,
            timeout: default_timeout(),
            endpoint: default_endpoint(),
            percentiles: default_percentiles(),
            report_times_multiplier: default_report_times_multiplier(),
            queue_capacity: default_queue_capacity(),
            pending_snapshots: default_pending_snapshots(),
            retry: RetryConfig::default(),
            auth_failure_threshold: default_auth_failure_threshold(),
            final_flush_timeout: default_final_flush_timeout(),
            preflight: true,
            compress: true,
            api_token: None,
            api_token_file: None,
            account_id: None,
            api_endpoint: default_api_endpoint(),
            dashboard_template_path: None,
            static_report: false,
        }
    }

    /// Check required fields and ranges.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.project.trim().is_empty() {
            return Err(invalid("project", "must not be empty"));
        }
        if self.dashboard_url.trim().is_empty() {
            return Err(invalid("dashboard-url", "must not be empty"));
        }
        if self.send_interval.is_zero() {
            return Err(invalid("send-interval", "must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be greater than zero"));
        }
        if self.percentiles.is_empty() {
            return Err(invalid("percentiles", "at least one rank is required"));
        }
        if let Some(p) = self
            .percentiles
            .iter()
            .find(|p| !p.is_finite() || **p < 0.0 || **p > 100.0)
        {
            return Err(invalid("percentiles", &format!("{p} is outside [0, 100]")));
        }
        if !self.report_times_multiplier.is_finite() || self.report_times_multiplier <= 0.0 {
            return Err(invalid(
                "report-times-multiplier",
                "must be a positive finite number",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue-capacity", "must be greater than zero"));
        }
        if self.pending_snapshots == 0 {
            return Err(invalid("pending-snapshots", "must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max-attempts", "must be at least 1"));
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(invalid(
                "retry.base-backoff",
                "must not exceed retry.max-backoff",
            ));
        }
        if self.auth_failure_threshold == 0 {
            return Err(invalid("auth-failure-threshold", "must be at least 1"));
        }
        if self.custom_tags.keys().any(|k| k.trim().is_empty()) {
            return Err(invalid("custom-tags", "tag names must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> CoreError {
    CoreError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Load and validate a configuration file.
///
/// The format follows the file extension (yaml, yml, toml, json).
pub fn load_config(path: &Path) -> Result<ReporterConfig, CoreError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| CoreError::Config(format!("failed to read {}: {e}", path.display())))?;

    let reporter: ReporterConfig = settings
        .try_deserialize()
        .map_err(|e| CoreError::Config(format!("invalid settings in {}: {e}", path.display())))?;

    reporter.validate()?;
    debug!(
        "config loaded from {}: project={}, send-interval={:?}",
        path.display(),
        reporter.project,
        reporter.send_interval
    );
    Ok(reporter)
}

fn default_true() -> bool {
    true
}
fn default_send_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}
fn default_percentiles() -> Vec<f64> {
    DEFAULT_PERCENTILES.to_vec()
}
fn default_report_times_multiplier() -> f64 {
    1000.0
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_pending_snapshots() -> usize {
    8
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff() -> Duration {
    Duration::from_secs(1)
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}
fn default_auth_failure_threshold() -> u32 {
    3
}
fn default_final_flush_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Durations as humantime strings ("5s", "250ms", "1m 30s") or plain seconds.
pub mod duration_str {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"5s\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            let v = v.trim();
            if let Ok(secs) = v.parse::<f64>() {
                return self.visit_f64(secs);
            }
            humantime::parse_duration(v).map_err(|e| E::custom(format!("{v:?}: {e}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration: {v}")))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(|e| E::custom(format!("{v}: {e}")))
        }
    }
}
