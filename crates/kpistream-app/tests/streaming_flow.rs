//! End-to-end sessions against a mock Metric API.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use kpistream_core::config::{ReporterConfig, RetryConfig};
use kpistream_core::error::CoreError;
use kpistream_core::models::sample::Sample;
use kpistream_core::models::session::SessionStatus;
use kpistream_network::http_client::HttpIngestClient;
use kpistream_pipeline::session::SessionController;
use mockito::Matcher;

const KEY: &str = "test-insert-key-1234";

fn config(server: &mockito::Server) -> ReporterConfig {
    let mut config = ReporterConfig::new("shop", "https://one.newrelic.com/dashboards");
    config.endpoint = format!("{}/metric/v1", server.url());
    config.token = Some(KEY.to_string());
    config.send_interval = Duration::from_secs(60);
    config.preflight = false;
    config.retry = RetryConfig {
        max_attempts: 5,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
    };
    config
}

fn controller(config: ReporterConfig) -> SessionController {
    let ingest = HttpIngestClient::new(&config.endpoint, config.timeout)
        .unwrap()
        .with_compression(config.compress);
    SessionController::new(config, Arc::new(ingest)).with_env_lookup(|_| None)
}

fn sample(i: u32) -> Sample {
    let label = if i % 2 == 0 { "home" } else { "cart" };
    let sample = Sample::new(label, Utc::now(), 0.1 + f64::from(i) / 100.0)
        .with_response_code("200")
        .with_threads(4);
    if i % 5 == 0 {
        sample.failed("timeout").with_response_code("504")
    } else {
        sample
    }
}

#[tokio::test]
async fn final_interval_reaches_ingest() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/metric/v1")
        .match_header("Api-Key", KEY)
        .match_header("Content-Encoding", "gzip")
        .match_header("Content-Type", "application/json")
        .with_status(202)
        .with_body(r#"{"requestId":"abc"}"#)
        .create_async()
        .await;

    let controller = controller(config(&server));
    let session = controller.start().await.unwrap();
    let collector = session.collector();
    for i in 0..20 {
        collector.submit(sample(i)).await.unwrap();
    }

    let summary = session.finish().await;

    mock.assert_async().await;
    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(summary.total_samples, 20);
    assert_eq!(summary.failed_samples, 4);
    assert_eq!(summary.intervals_delivered, 1);
    assert_eq!(summary.intervals_dropped, 0);
    assert_eq!(summary.dashboard_link, "https://one.newrelic.com/dashboards");
}

#[tokio::test]
async fn server_errors_are_retried_until_accepted() {
    let mut server = mockito::Server::new_async().await;
    // mockito serves a mock that is still short of its expected hits first
    let failing = server
        .mock("POST", "/metric/v1")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;
    let accepting = server
        .mock("POST", "/metric/v1")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let controller = controller(config(&server));
    let session = controller.start().await.unwrap();
    for i in 1..=5 {
        session.collector().submit(sample(i)).await.unwrap();
    }
    let summary = session.finish().await;

    failing.assert_async().await;
    accepting.assert_async().await;
    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(summary.intervals_delivered, 1);
    assert_eq!(summary.delivery_attempts, 4);
}

#[tokio::test]
async fn preflight_rejection_fails_the_session() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/metric/v1")
        .with_status(403)
        .expect(1)
        .create_async()
        .await;

    let mut config = config(&server);
    config.preflight = true;
    let controller = controller(config);

    assert_matches!(controller.start().await, Err(CoreError::AuthDelivery { status: 403 }));
    mock.assert_async().await;
    assert_eq!(controller.summary().status, SessionStatus::AuthFailed);
}

#[tokio::test]
async fn missing_credential_sends_nothing() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let mut config = config(&server);
    config.token = None;
    config.preflight = true;
    let controller = controller(config);

    assert_matches!(controller.start().await, Err(CoreError::CredentialMissing(_)));
    mock.assert_async().await;
    let summary = controller.summary();
    assert_eq!(summary.status, SessionStatus::CredentialMissing);
    assert_eq!(summary.delivery_attempts, 0);
}

#[tokio::test]
async fn malformed_samples_are_counted_not_sent() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/metric/v1")
        .with_status(202)
        .create_async()
        .await;

    let mut config = config(&server);
    config.compress = false;
    let controller = controller(config);
    let session = controller.start().await.unwrap();
    let collector = session.collector();
    collector.submit(sample(1)).await.unwrap();
    collector.submit(Sample::new("", Utc::now(), 0.2)).await.unwrap();
    collector.submit(Sample::new("home", Utc::now(), -1.0)).await.unwrap();

    let summary = session.finish().await;

    mock.assert_async().await;
    assert_eq!(summary.total_samples, 1);
    assert_eq!(summary.rejected_samples, 2);
    assert_eq!(summary.total_samples + summary.rejected_samples, collector.submitted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fast_producers_lose_no_samples() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/metric/v1")
        .with_status(202)
        .expect_at_least(1)
        .create_async()
        .await;

    let mut config = config(&server);
    config.queue_capacity = 4;
    config.send_interval = Duration::from_millis(20);
    let controller = controller(config);
    let session = controller.start().await.unwrap();

    let mut producers = Vec::new();
    for p in 0..4u32 {
        let collector = session.collector();
        producers.push(tokio::spawn(async move {
            for i in 0..500u32 {
                let sample = if i % 50 == 0 {
                    Sample::new("bad", Utc::now(), f64::NAN)
                } else {
                    sample(p * 1000 + i)
                };
                collector.submit(sample).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    let submitted = session.collector().submitted();
    let summary = session.finish().await;

    mock.assert_async().await;
    assert_eq!(submitted, 2000);
    assert_eq!(summary.rejected_samples, 40);
    assert_eq!(summary.total_samples + summary.rejected_samples, submitted);
    assert_eq!(summary.intervals_dropped, 0);
}
