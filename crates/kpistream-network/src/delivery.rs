//! Payload delivery with retry.
//!
//! Classifies each response, retries transient failures with exponential
//! backoff (honoring `Retry-After`) and reports every attempt to an
//! `AttemptSink`. Never returns an error: the outcome is a `DeliveryResult`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kpistream_core::config::RetryConfig;
use kpistream_core::models::delivery::{
    AttemptOutcome, DeliveryAttempt, DeliveryResult, EncodedPayload,
};
use kpistream_core::ports::attempt_sink::{AttemptSink, NoopAttemptSink};
use kpistream_core::ports::ingest_client::IngestClient;
use tracing::{debug, error, warn};

/// Map an HTTP status onto an attempt outcome.
///
/// 2xx succeeds; 408, 429 and 5xx are worth retrying; any other status is fatal.
pub fn classify(status: u16) -> AttemptOutcome {
    match status {
        200..=299 => AttemptOutcome::Success,
        408 | 429 | 500..=599 => AttemptOutcome::TransientFailure,
        _ => AttemptOutcome::FatalFailure,
    }
}

/// 401 and 403
pub fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// Sends payloads, one request at a time per caller.
pub struct DeliveryClient {
    ingest: Arc<dyn IngestClient>,
    retry: RetryConfig,
    sink: Arc<dyn AttemptSink>,
}

impl DeliveryClient {
    pub fn new(ingest: Arc<dyn IngestClient>, retry: RetryConfig) -> Self {
        Self {
            ingest,
            retry,
            sink: Arc::new(NoopAttemptSink),
        }
    }

    /// Observer for every attempt, e.g. the app's event bus.
    pub fn with_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Deliver one payload.
    ///
    /// Transient failures are retried up to `max-attempts`, after which the
    /// payload is dropped. Fatal statuses return at once without retry.
    pub async fn deliver(&self, payload: &EncodedPayload) -> DeliveryResult {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.base_backoff;
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let result = self.ingest.post(payload).await;
            let latency = started.elapsed();

            let (outcome, status, retry_after) = match &result {
                Ok(resp) => {
                    last_reason = format!("status {}: {}", resp.status, resp.body);
                    (classify(resp.status), Some(resp.status), resp.retry_after_secs)
                }
                Err(e) if e.is_retryable() => {
                    last_reason = e.to_string();
                    (AttemptOutcome::TransientFailure, None, None)
                }
                Err(e) => {
                    last_reason = e.to_string();
                    (AttemptOutcome::FatalFailure, None, None)
                }
            };

            self.sink.record(&DeliveryAttempt {
                sequence: payload.sequence,
                attempt,
                outcome,
                status,
                latency,
            });

            match (outcome, status) {
                (AttemptOutcome::Success, _) => {
                    debug!(
                        "delivered #{} ({}) on attempt {attempt} in {latency:?}",
                        payload.sequence, payload.window
                    );
                    return DeliveryResult::Delivered { attempts: attempt };
                }
                (AttemptOutcome::FatalFailure, Some(status)) => {
                    let auth = is_auth_status(status);
                    if auth {
                        error!(
                            "delivery of #{} rejected: credential {} not accepted (status {status})",
                            payload.sequence,
                            payload.credential.masked()
                        );
                    } else {
                        error!(
                            "delivery of #{} ({}) rejected, {last_reason}",
                            payload.sequence, payload.window
                        );
                    }
                    return DeliveryResult::Rejected { status, auth };
                }
                (AttemptOutcome::FatalFailure, None) => {
                    error!(
                        "delivery of #{} ({}) failed without a response: {last_reason}",
                        payload.sequence, payload.window
                    );
                    return DeliveryResult::Dropped {
                        reason: last_reason,
                        attempts: attempt,
                    };
                }
                (AttemptOutcome::TransientFailure, _) => {
                    if attempt == max_attempts {
                        break;
                    }
                    let wait = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or(delay)
                        .min(self.retry.max_backoff);
                    warn!(
                        "delivery of #{} failed (attempt {attempt}/{max_attempts}): {last_reason}, retrying in {wait:?}",
                        payload.sequence
                    );
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(self.retry.max_backoff);
                }
            }
        }

        warn!(
            "dropping #{} ({}) after {max_attempts} attempts: {last_reason}",
            payload.sequence, payload.window
        );
        DeliveryResult::Dropped {
            reason: last_reason,
            attempts: max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kpistream_core::credential::{Credential, CredentialSource};
    use kpistream_core::error::CoreError;
    use kpistream_core::models::delivery::IngestResponse;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses, then answers 202.
    struct ScriptedIngest {
        script: Mutex<VecDeque<Result<IngestResponse, CoreError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedIngest {
        fn new(script: Vec<Result<IngestResponse, CoreError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl IngestClient for ScriptedIngest {
        async fn post(&self, _payload: &EncodedPayload) -> Result<IngestResponse, CoreError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(202)))
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<DeliveryAttempt>>);

    impl AttemptSink for RecordingSink {
        fn record(&self, attempt: &DeliveryAttempt) {
            self.0.lock().unwrap().push(attempt.clone());
        }
    }

    fn status(code: u16) -> IngestResponse {
        IngestResponse {
            status: code,
            body: String::new(),
            retry_after_secs: None,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn payload() -> EncodedPayload {
        EncodedPayload {
            sequence: 9,
            window: "w".to_string(),
            body: b"[]".to_vec(),
            metric_count: 0,
            credential: Credential::new("key-1234", CredentialSource::Config),
            is_final: false,
        }
    }

    #[test]
    fn classification() {
        assert_eq!(classify(200), AttemptOutcome::Success);
        assert_eq!(classify(202), AttemptOutcome::Success);
        assert_eq!(classify(429), AttemptOutcome::TransientFailure);
        assert_eq!(classify(408), AttemptOutcome::TransientFailure);
        assert_eq!(classify(503), AttemptOutcome::TransientFailure);
        assert_eq!(classify(400), AttemptOutcome::FatalFailure);
        assert_eq!(classify(401), AttemptOutcome::FatalFailure);
        assert_eq!(classify(413), AttemptOutcome::FatalFailure);
        assert!(is_auth_status(403));
        assert!(!is_auth_status(404));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let ingest = Arc::new(ScriptedIngest::new(vec![
            Ok(status(500)),
            Ok(status(500)),
            Ok(status(500)),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let client = DeliveryClient::new(ingest.clone(), fast_retry(5)).with_sink(sink.clone());

        let result = client.deliver(&payload()).await;

        assert_eq!(result, DeliveryResult::Delivered { attempts: 4 });
        assert_eq!(ingest.calls(), 4);
        let attempts = sink.0.lock().unwrap();
        let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::TransientFailure,
                AttemptOutcome::TransientFailure,
                AttemptOutcome::TransientFailure,
                AttemptOutcome::Success,
            ]
        );
        assert_eq!(attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(attempts.iter().all(|a| a.sequence == 9));
    }

    #[tokio::test]
    async fn auth_rejection_is_not_retried() {
        let ingest = Arc::new(ScriptedIngest::new(vec![Ok(status(401))]));
        let client = DeliveryClient::new(ingest.clone(), fast_retry(5));

        let result = client.deliver(&payload()).await;

        assert_eq!(
            result,
            DeliveryResult::Rejected {
                status: 401,
                auth: true
            }
        );
        assert_eq!(ingest.calls(), 1);
    }

    #[tokio::test]
    async fn bad_request_is_rejected_without_auth_flag() {
        let ingest = Arc::new(ScriptedIngest::new(vec![Ok(status(400))]));
        let client = DeliveryClient::new(ingest, fast_retry(5));
        assert_eq!(
            client.deliver(&payload()).await,
            DeliveryResult::Rejected {
                status: 400,
                auth: false
            }
        );
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_payload() {
        let ingest = Arc::new(ScriptedIngest::new(vec![
            Err(CoreError::Network("connection reset".into())),
            Ok(status(503)),
            Ok(status(502)),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let client = DeliveryClient::new(ingest.clone(), fast_retry(3)).with_sink(sink.clone());

        let result = client.deliver(&payload()).await;

        assert!(matches!(result, DeliveryResult::Dropped { attempts: 3, .. }));
        assert_eq!(ingest.calls(), 3);
        let attempts = sink.0.lock().unwrap();
        assert_eq!(attempts[0].status, None);
        assert_eq!(attempts[2].status, Some(502));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_backoff() {
        let mut throttled = status(429);
        throttled.retry_after_secs = Some(7);
        let ingest = Arc::new(ScriptedIngest::new(vec![Ok(throttled)]));
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        };
        let client = DeliveryClient::new(ingest.clone(), retry);

        let started = tokio::time::Instant::now();
        let result = client.deliver(&payload()).await;

        assert_eq!(result, DeliveryResult::Delivered { attempts: 2 });
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let ingest = Arc::new(ScriptedIngest::new(vec![
            Ok(status(500)),
            Ok(status(500)),
            Ok(status(500)),
            Ok(status(500)),
        ]));
        let retry = RetryConfig {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
        };
        let client = DeliveryClient::new(ingest, retry);

        let started = tokio::time::Instant::now();
        client.deliver(&payload()).await;

        // 1 + 2 + 3 + 3
        assert_eq!(started.elapsed().as_secs(), 9);
    }

    #[tokio::test]
    async fn non_retryable_error_drops_immediately() {
        let ingest = Arc::new(ScriptedIngest::new(vec![Err(CoreError::Internal(
            "gzip compression failed".into(),
        ))]));
        let client = DeliveryClient::new(ingest.clone(), fast_retry(5));
        assert!(matches!(
            client.deliver(&payload()).await,
            DeliveryResult::Dropped { attempts: 1, .. }
        ));
        assert_eq!(ingest.calls(), 1);
    }
}
