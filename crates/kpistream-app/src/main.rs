//! kpistream binary.
//!
//! Reads samples (NDJSON) from a file or stdin, aggregates them per send
//! interval and streams the results to the New Relic Metric API.
//!
//! Exit codes: 0 completed, 2 bad configuration, 3 no insert key,
//! 4 ingestion rejected the credentials.

mod browser;
mod event_bus;
mod lifecycle;
mod source;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kpistream_core::config::{load_config, BrowserOpen, ReporterConfig};
use kpistream_core::credential::CredentialResolver;
use kpistream_core::models::session::{SessionStatus, SessionSummary};
use kpistream_core::ports::dashboard::DashboardProvider;
use kpistream_network::dashboard::{GraphqlDashboard, StaticDashboard};
use kpistream_network::http_client::HttpIngestClient;
use kpistream_pipeline::session::{Control, SessionController};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::browser::SystemBrowser;
use crate::event_bus::{spawn_event_logger, EventBus, ReporterEvent};
use crate::lifecycle::LifecycleManager;

const EXIT_CONFIG: u8 = 2;
const EXIT_CREDENTIAL: u8 = 3;
const EXIT_AUTH: u8 = 4;

/// Stream load-test results to New Relic
#[derive(Parser, Debug)]
#[command(name = "kpistream", version, about)]
struct Args {
    /// Settings file (yaml, toml or json)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// NDJSON sample file; stdin when omitted or "-"
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Project name (overrides the file)
    #[arg(long)]
    project: Option<String>,

    /// Fallback dashboard link (overrides the file)
    #[arg(long)]
    dashboard_url: Option<String>,

    /// Aggregation window, e.g. "5s" or "500ms"
    #[arg(long, value_parser = humantime::parse_duration)]
    send_interval: Option<Duration>,

    /// Metric API endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Open the dashboard: start, end, both or none
    #[arg(long)]
    browser_open: Option<BrowserOpen>,

    /// Skip the startup connectivity check
    #[arg(long)]
    no_preflight: bool,

    /// Send uncompressed request bodies
    #[arg(long)]
    no_compress: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_filter = format!(
        "kpistream={0},kpistream_core={0},kpistream_pipeline={0},kpistream_network={0}",
        args.log_level
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("kpistream v{}", env!("CARGO_PKG_VERSION"));

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(args, config).await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::from(exit_code(summary.status))
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// File settings (when given) with command-line overrides applied, validated.
fn build_config(args: &Args) -> Result<ReporterConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => {
            let (Some(project), Some(url)) = (&args.project, &args.dashboard_url) else {
                bail!("without --config both --project and --dashboard-url are required");
            };
            ReporterConfig::new(project.clone(), url.clone())
        }
    };

    if let Some(project) = &args.project {
        config.project = project.clone();
    }
    if let Some(url) = &args.dashboard_url {
        config.dashboard_url = url.clone();
    }
    if let Some(interval) = args.send_interval {
        config.send_interval = interval;
    }
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(open) = args.browser_open {
        config.browser_open = open;
    }
    if args.no_preflight {
        config.preflight = false;
    }
    if args.no_compress {
        config.compress = false;
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: Args, config: ReporterConfig) -> Result<SessionSummary> {
    let ingest = HttpIngestClient::new(&config.endpoint, config.timeout)
        .context("invalid ingestion endpoint")?
        .with_compression(config.compress)
        .with_final_timeout(config.final_flush_timeout);
    let reader = open_input(args.input.as_deref()).await?;
    let dashboard = build_dashboard(&config).await;

    let bus = Arc::new(EventBus::default());
    let logger = spawn_event_logger(&bus);

    let controller = SessionController::new(config, Arc::new(ingest))
        .with_dashboard(dashboard)
        .with_attempt_sink(bus.clone())
        .with_link_opener(Arc::new(SystemBrowser));

    let session = match controller.start().await {
        Ok(session) => session,
        Err(e) => {
            warn!("session not started: {e}");
            let summary = controller.summary();
            bus.publish(ReporterEvent::Stopped(summary.clone()));
            let _ = logger.await;
            return Ok(summary);
        }
    };
    bus.publish(ReporterEvent::Started {
        session_id: session.session_id(),
        dashboard_link: session.dashboard_link(),
    });

    let lifecycle = Arc::new(LifecycleManager::new());
    let mut shutdown = lifecycle.subscribe();
    let signals = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.wait_for_signal().await })
    };

    let mut control = session.control();

    tokio::select! {
        res = source::pump(reader, session.collector()) => match res {
            Ok(stats) => info!(
                "input finished: {} samples submitted, {} malformed lines",
                stats.submitted, stats.malformed
            ),
            Err(e) => warn!("input failed: {e}"),
        },
        _ = shutdown.changed() => info!("stopping on signal"),
        _ = control.wait_for(|c| *c == Control::Abort) => warn!("session aborted"),
    }
    signals.abort();

    let summary = session.finish().await;
    bus.publish(ReporterEvent::Stopped(summary.clone()));
    let _ = logger.await;
    Ok(summary)
}

async fn open_input(path: Option<&std::path::Path>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match path {
        Some(path) if path.as_os_str() != "-" => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open input {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        _ => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

/// NerdGraph-backed dashboards when an API key resolves, the static link otherwise.
async fn build_dashboard(config: &ReporterConfig) -> Arc<dyn DashboardProvider> {
    let fallback = || -> Arc<dyn DashboardProvider> {
        Arc::new(StaticDashboard::new(config.dashboard_url.clone()))
    };

    let api_key = match CredentialResolver::api_key(config).resolve() {
        Ok(key) => key,
        Err(_) => {
            info!("no API key, using the static dashboard link");
            return fallback();
        }
    };

    let mut graphql = match GraphqlDashboard::new(&config.api_endpoint, api_key, config.timeout) {
        Ok(g) => g.with_account_id(config.account_id.clone()),
        Err(e) => {
            warn!("dashboard API unavailable: {e}");
            return fallback();
        }
    };
    if let Some(path) = &config.dashboard_template_path {
        graphql = match graphql.with_template_file(path) {
            Ok(g) => g,
            Err(e) => {
                warn!("dashboard template not loaded: {e}");
                return fallback();
            }
        };
    }

    match graphql.api_check().await {
        Ok(user) => {
            info!("dashboard API authenticated as {user}");
            Arc::new(graphql)
        }
        Err(e) => {
            warn!("dashboard API check failed: {e}");
            fallback()
        }
    }
}

fn exit_code(status: SessionStatus) -> u8 {
    match status {
        SessionStatus::Active | SessionStatus::Completed => 0,
        SessionStatus::CredentialMissing => EXIT_CREDENTIAL,
        SessionStatus::AuthFailed => EXIT_AUTH,
    }
}

fn print_summary(summary: &SessionSummary) {
    println!("session:    {}", summary.session_id);
    println!("status:     {:?}", summary.status);
    println!(
        "samples:    {} ({} failed, {:.2}%; {} rejected)",
        summary.total_samples,
        summary.failed_samples,
        summary.failure_percent(),
        summary.rejected_samples
    );
    println!(
        "intervals:  {} delivered, {} dropped, {} attempts",
        summary.intervals_delivered, summary.intervals_dropped, summary.delivery_attempts
    );
    if !summary.dashboard_link.is_empty() {
        println!("dashboard:  {}", summary.dashboard_link);
    }
}
