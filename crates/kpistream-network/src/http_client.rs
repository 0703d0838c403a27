//! HTTP ingestion client.
//!
//! `IngestClient` port implementation over reqwest. Injects the `Api-Key`
//! header, gzips the body and hands back the raw status for classification.

use std::time::Duration;

use async_trait::async_trait;
use kpistream_core::error::CoreError;
use kpistream_core::models::delivery::{EncodedPayload, IngestResponse};
use kpistream_core::ports::ingest_client::IngestClient;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use tracing::{debug, warn};

use crate::compression::gzip;

/// Response bodies are truncated to this many bytes in errors and logs
const MAX_BODY_EXCERPT: usize = 512;

/// Metric API client
#[derive(Debug)]
pub struct HttpIngestClient {
    client: reqwest::Client,
    endpoint: String,
    compress: bool,
    timeout: Duration,
    final_timeout: Option<Duration>,
}

impl HttpIngestClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CoreError> {
        let parsed = url::Url::parse(endpoint)
            .map_err(|e| CoreError::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CoreError::Config(format!(
                "endpoint must be http(s), got {endpoint:?}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("kpistream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::Network(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            compress: true,
            timeout,
            final_timeout: None,
        })
    }

    /// Per-request timeout for the end-of-session flush.
    pub fn with_final_timeout(mut self, timeout: Duration) -> Self {
        self.final_timeout = Some(timeout);
        self
    }

    /// Toggle gzip request bodies (on by default).
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_timeout(&self, payload: &EncodedPayload) -> Duration {
        match self.final_timeout {
            Some(final_timeout) if payload.is_final => final_timeout.max(self.timeout),
            _ => self.timeout,
        }
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn post(&self, payload: &EncodedPayload) -> Result<IngestResponse, CoreError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Api-Key", payload.credential.expose())
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout(payload));

        let body = if self.compress {
            req = req.header(CONTENT_ENCODING, "gzip");
            gzip(&payload.body)?
        } else {
            payload.body.clone()
        };
        debug!(
            "POST {} #{} ({} metrics, {} bytes)",
            self.endpoint,
            payload.sequence,
            payload.metric_count,
            body.len()
        );

        let resp = req.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::Network(format!("request timed out: {e}"))
            } else {
                CoreError::Network(format!("request failed: {e}"))
            }
        })?;

        let status = resp.status().as_u16();
        let retry_after_secs = parse_retry_after(resp.headers().get(RETRY_AFTER));
        let text = resp.text().await.unwrap_or_else(|e| {
            warn!("failed to read response body: {e}");
            String::new()
        });

        Ok(IngestResponse {
            status,
            body: excerpt(&text),
            retry_after_secs,
        })
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn excerpt(text: &str) -> String {
    if text.len() <= MAX_BODY_EXCERPT {
        return text.to_string();
    }
    let mut end = MAX_BODY_EXCERPT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
