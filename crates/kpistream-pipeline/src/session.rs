//! Session controller.
//!
//! Owns the reporting lifecycle: `Idle -> Starting -> Running -> Draining ->
//! Stopped`. Starting resolves the credential, acquires the dashboard link and
//! runs the preflight; Running has the aggregator and the delivery worker as
//! tasks; `finish()` drains within `final-flush-timeout` and returns the summary.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use kpistream_core::config::ReporterConfig;
use kpistream_core::credential::{Credential, CredentialResolver};
use kpistream_core::error::CoreError;
use kpistream_core::models::delivery::{AttemptOutcome, DeliveryAttempt};
use kpistream_core::models::session::{SessionPhase, SessionStatus, SessionSummary};
use kpistream_core::models::snapshot::AggregateSnapshot;
use kpistream_core::ports::attempt_sink::{AttemptSink, NoopAttemptSink};
use kpistream_core::ports::dashboard::DashboardProvider;
use kpistream_core::ports::ingest_client::IngestClient;
use kpistream_core::ports::link_opener::LinkOpener;
use kpistream_network::dashboard::StaticDashboard;
use kpistream_network::delivery::{classify, is_auth_status, DeliveryClient};
use kpistream_network::encoder::PayloadEncoder;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::collector::SampleCollector;
use crate::state::{SessionState, SharedState};
use crate::worker::DeliveryWorker;

/// Signal from the controller (or the worker, on abort) to the tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    /// Close intake, flush what is queued
    Drain,
    /// Stop without flushing
    Abort,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds and starts a reporting session
pub struct SessionController {
    config: Arc<ReporterConfig>,
    ingest: Arc<dyn IngestClient>,
    dashboard: Arc<dyn DashboardProvider>,
    sink: Arc<dyn AttemptSink>,
    opener: Option<Arc<dyn LinkOpener>>,
    env: EnvLookup,
    state: SharedState,
}

impl SessionController {
    pub fn new(config: ReporterConfig, ingest: Arc<dyn IngestClient>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let state = SessionState::new(session_id, config.auth_failure_threshold).shared();
        let dashboard = Arc::new(StaticDashboard::new(config.dashboard_url.clone()));
        Self {
            config: Arc::new(config),
            ingest,
            dashboard,
            sink: Arc::new(NoopAttemptSink),
            opener: None,
            env: Arc::new(|name| std::env::var(name).ok()),
            state,
        }
    }

    pub fn with_dashboard(mut self, dashboard: Arc<dyn DashboardProvider>) -> Self {
        self.dashboard = dashboard;
        self
    }

    pub fn with_attempt_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_link_opener(mut self, opener: Arc<dyn LinkOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Replace the environment used for credential lookup.
    pub fn with_env_lookup<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(env);
        self
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session_id().to_string()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase()
    }

    /// Current counters; final once the session is stopped.
    pub fn summary(&self) -> SessionSummary {
        self.state.lock().summary()
    }

    /// Start the session.
    ///
    /// Fails with `CredentialMissing` when no insert key resolves, and with
    /// `AuthDelivery` when the preflight is rejected; the session is then
    /// stopped and `summary()` reports why.
    pub async fn start(&self) -> Result<RunningSession, CoreError> {
        self.state.lock().set_phase(SessionPhase::Starting);
        let session_id = self.session_id();
        info!("starting session {session_id} for project {:?}", self.config.project);

        let env = self.env.clone();
        let credential = match CredentialResolver::insert_key(&self.config).resolve_with(|n| env(n)) {
            Ok(credential) => credential,
            Err(e) => {
                error!("{e}; set {} or token / token-file", kpistream_core::credential::INSERT_KEY_ENV);
                self.state.lock().finish(SessionStatus::CredentialMissing);
                return Err(e);
            }
        };

        let (link, link_acquired) = self.acquire_link().await;
        self.state.lock().set_dashboard_link(link.clone());

        let encoder = PayloadEncoder::new(&self.config.project, &session_id)
            .with_account_id(self.config.account_id.clone())
            .with_times_multiplier(self.config.report_times_multiplier);
        if self.config.preflight {
            self.preflight(&encoder, &credential).await?;
        }

        let (collector, samples) = SampleCollector::channel(self.config.queue_capacity);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(self.config.pending_snapshots.max(1));
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let control = Arc::new(control_tx);

        let aggregator = Aggregator::new(
            self.config.percentiles.clone(),
            self.config.custom_tags.clone(),
            self.state.clone(),
        )?;
        let delivery = DeliveryClient::new(self.ingest.clone(), self.config.retry.clone())
            .with_sink(self.sink.clone());
        let worker = Arc::new(DeliveryWorker::new(
            encoder,
            delivery,
            credential,
            self.config.custom_tags.clone(),
            self.state.clone(),
            control.clone(),
        ));

        let aggregator_task = tokio::spawn(aggregator.run(
            samples,
            self.config.send_interval,
            snapshot_tx,
            control_rx,
        ));
        let worker_task = tokio::spawn(worker.clone().run(snapshot_rx));

        self.state.lock().set_phase(SessionPhase::Running);
        info!("session {session_id} running, dashboard: {link}");
        if self.config.browser_open.at_start() {
            open_link(self.opener.as_deref(), &link);
        }

        Ok(RunningSession {
            config: self.config.clone(),
            collector,
            control,
            aggregator: aggregator_task,
            worker_task,
            worker,
            state: self.state.clone(),
            dashboard: self.dashboard.clone(),
            opener: self.opener.clone(),
            link_acquired,
            started_at: Utc::now(),
        })
    }

    async fn acquire_link(&self) -> (String, bool) {
        match self.dashboard.dashboard_link(&self.config.project).await {
            Ok(link) if !link.trim().is_empty() => (link, true),
            Ok(_) => (self.config.dashboard_url.clone(), false),
            Err(e) => {
                warn!(
                    "dashboard link unavailable: {e}, using {}",
                    self.config.dashboard_url
                );
                (self.config.dashboard_url.clone(), false)
            }
        }
    }

    /// Post an empty batch once to check connectivity and the key.
    async fn preflight(&self, encoder: &PayloadEncoder, credential: &Credential) -> Result<(), CoreError> {
        let payload = match encoder.encode_empty(credential, &self.config.custom_tags) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("preflight skipped: {e}");
                return Ok(());
            }
        };

        let started = Instant::now();
        let response = self.ingest.post(&payload).await;
        let latency = started.elapsed();

        match response {
            Ok(resp) => {
                let outcome = classify(resp.status);
                self.sink.record(&DeliveryAttempt {
                    sequence: 0,
                    attempt: 1,
                    outcome,
                    status: Some(resp.status),
                    latency,
                });
                match outcome {
                    AttemptOutcome::Success => {
                        info!("preflight accepted in {latency:?}");
                    }
                    AttemptOutcome::FatalFailure if is_auth_status(resp.status) => {
                        error!(
                            "preflight rejected (status {}): credential {credential} not accepted",
                            resp.status
                        );
                        self.state.lock().finish(SessionStatus::AuthFailed);
                        return Err(CoreError::AuthDelivery { status: resp.status });
                    }
                    _ => warn!(
                        "preflight returned status {}: {}; continuing",
                        resp.status, resp.body
                    ),
                }
            }
            Err(e) => {
                self.sink.record(&DeliveryAttempt {
                    sequence: 0,
                    attempt: 1,
                    outcome: AttemptOutcome::TransientFailure,
                    status: None,
                    latency,
                });
                warn!("preflight failed: {e}; continuing");
            }
        }
        Ok(())
    }
}

/// A started session
pub struct RunningSession {
    config: Arc<ReporterConfig>,
    collector: SampleCollector,
    control: Arc<watch::Sender<Control>>,
    aggregator: JoinHandle<Option<AggregateSnapshot>>,
    worker_task: JoinHandle<()>,
    worker: Arc<DeliveryWorker>,
    state: SharedState,
    dashboard: Arc<dyn DashboardProvider>,
    opener: Option<Arc<dyn LinkOpener>>,
    link_acquired: bool,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for RunningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningSession")
            .field("link_acquired", &self.link_acquired)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl RunningSession {
    /// Producer handle; clone freely.
    pub fn collector(&self) -> SampleCollector {
        self.collector.clone()
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session_id().to_string()
    }

    pub fn dashboard_link(&self) -> String {
        self.state.lock().dashboard_link().to_string()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase()
    }

    /// Watch for `Control::Abort` raised by auth escalation.
    pub fn control(&self) -> watch::Receiver<Control> {
        self.control.subscribe()
    }

    pub fn is_aborted(&self) -> bool {
        *self.control.borrow() == Control::Abort
    }

    /// Counters so far.
    pub fn progress(&self) -> SessionSummary {
        self.state.lock().summary()
    }

    /// Drain and stop. Bounded by `final-flush-timeout`.
    pub async fn finish(self) -> SessionSummary {
        let RunningSession {
            config,
            collector: _,
            control,
            mut aggregator,
            mut worker_task,
            worker,
            state,
            dashboard,
            opener,
            link_acquired,
            started_at,
        } = self;

        let aborted = *control.borrow() == Control::Abort;
        if !aborted {
            state.lock().set_phase(SessionPhase::Draining);
            control.send_replace(Control::Drain);
        }
        let deadline = tokio::time::Instant::now() + config.final_flush_timeout;

        let final_snapshot = match tokio::time::timeout_at(deadline, &mut aggregator).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                error!("aggregator task failed: {e}");
                None
            }
            Err(_) => {
                warn!("aggregator did not drain within {:?}", config.final_flush_timeout);
                aggregator.abort();
                None
            }
        };

        // The aggregator owned the snapshot sender, so the worker stops once the
        // pending queue is empty.
        if tokio::time::timeout_at(deadline, &mut worker_task).await.is_err() {
            warn!(
                "pending intervals not delivered within {:?}, giving up",
                config.final_flush_timeout
            );
            worker_task.abort();
        }

        // The final send shares the drain deadline; the ingest client may give
        // the request itself a longer timeout than regular intervals.
        let still_running = *control.borrow() != Control::Abort;
        if let Some(snapshot) = final_snapshot.filter(|_| still_running) {
            debug!("flushing final snapshot #{}", snapshot.sequence);
            if tokio::time::timeout_at(deadline, worker.process(&snapshot))
                .await
                .is_err()
            {
                warn!(
                    "final interval not delivered within {:?}",
                    config.final_flush_timeout
                );
            }
        }

        let reason = if *control.borrow() == Control::Abort {
            "session aborted"
        } else {
            "final flush deadline passed"
        };
        state.lock().drop_unsettled(reason);

        state.lock().finish(SessionStatus::Completed);
        let status = state.lock().status();
        if status == SessionStatus::Completed {
            if !link_acquired {
                match dashboard.dashboard_link(&config.project).await {
                    Ok(link) if !link.trim().is_empty() => state.lock().set_dashboard_link(link),
                    Ok(_) => {}
                    Err(e) => debug!("dashboard link still unavailable: {e}"),
                }
            }
            if config.browser_open.at_end() {
                let link = state.lock().dashboard_link().to_string();
                open_link(opener.as_deref(), &link);
            }
            if config.static_report {
                match dashboard.static_report(started_at, Utc::now()).await {
                    Ok(Some(path)) => info!("static report: {}", path.display()),
                    Ok(None) => debug!("no static report produced"),
                    Err(e) => warn!("static report failed: {e}"),
                }
            }
        }

        let summary = state.lock().summary();
        info!(
            "session {} stopped ({:?}): {} samples, {:.2}% failed, {} intervals delivered, {} dropped",
            summary.session_id,
            summary.status,
            summary.total_samples,
            summary.failure_percent(),
            summary.intervals_delivered,
            summary.intervals_dropped
        );
        summary
    }
}

fn open_link(opener: Option<&dyn LinkOpener>, link: &str) {
    let Some(opener) = opener else {
        return;
    };
    if let Err(e) = opener.open(link) {
        warn!("can't open {link}: {e}");
    }
}
