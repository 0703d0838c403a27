//! Dashboard providers.
//!
//! `StaticDashboard` hands back the configured link. `GraphqlDashboard` talks to
//! NerdGraph: finds the project's "Load Tests [project]" dashboard, creates it
//! from a template when missing, and renders static PDF reports.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use kpistream_core::credential::Credential;
use kpistream_core::error::CoreError;
use kpistream_core::ports::dashboard::DashboardProvider;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Dashboard list, used when a project dashboard can't be resolved
pub const DEFAULT_DASHBOARDS_LINK: &str = "https://one.newrelic.com/dashboards";

/// Template placeholder for the project name
pub const PROJECT_PLACEHOLDER: &str = "PROJECT_PLACE_HOLDER";

/// Template placeholder for the account id
pub const ACCOUNT_PLACEHOLDER: &str = "ACCOUNT_PLACE_HOLDER";

const DEFAULT_POLL_ATTEMPTS: u32 = 5;
const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(10);

/// Always returns the configured link.
#[derive(Debug, Clone)]
pub struct StaticDashboard {
    link: String,
}

impl StaticDashboard {
    pub fn new(link: impl Into<String>) -> Self {
        Self { link: link.into() }
    }
}

#[async_trait]
impl DashboardProvider for StaticDashboard {
    async fn dashboard_link(&self, _project: &str) -> Result<String, CoreError> {
        Ok(self.link.clone())
    }
}

/// A dashboard entity found by search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardEntity {
    pub guid: String,
    pub permalink: String,
}

/// NerdGraph dashboard manager
pub struct GraphqlDashboard {
    client: reqwest::Client,
    endpoint: String,
    api_key: Credential,
    account_id: Mutex<Option<String>>,
    template: Option<String>,
    dashboard_guid: Mutex<Option<String>>,
    poll_attempts: u32,
    poll_delay: Duration,
    report_dir: PathBuf,
}

impl GraphqlDashboard {
    pub fn new(endpoint: &str, api_key: Credential, timeout: Duration) -> Result<Self, CoreError> {
        url::Url::parse(endpoint)
            .map_err(|e| CoreError::Config(format!("invalid api-endpoint {endpoint:?}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Network(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            account_id: Mutex::new(None),
            template: None,
            dashboard_guid: Mutex::new(None),
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_delay: DEFAULT_POLL_DELAY,
            report_dir: PathBuf::from("."),
        })
    }

    /// Fixed account id; looked up from the API when absent.
    pub fn with_account_id(self, account_id: Option<String>) -> Self {
        Self {
            account_id: Mutex::new(account_id),
            ..self
        }
    }

    /// `dashboardCreate` mutation with project/account placeholders.
    pub fn with_template(mut self, template: Option<String>) -> Self {
        self.template = template;
        self
    }

    /// Load the creation template from a file.
    pub fn with_template_file(self, path: &Path) -> Result<Self, CoreError> {
        let template = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("dashboard template {}: {e}", path.display()))
        })?;
        Ok(self.with_template(Some(template)))
    }

    /// Attempts and delay for permalink and snapshot polling.
    pub fn with_polling(mut self, attempts: u32, delay: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_delay = delay;
        self
    }

    /// Directory static reports are written to.
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }

    /// Verify the API key; returns the owning user's name.
    pub async fn api_check(&self) -> Result<String, CoreError> {
        let data = self.execute("{ actor { user { name } } }").await?;
        let name = str_at(&data, "/data/actor/user/name")?;
        info!("API key accepted, owned by {name}");
        Ok(name)
    }

    /// Configured account id, or the first account visible to the key.
    pub async fn account_id(&self) -> Result<String, CoreError> {
        let mut cached = self.account_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let data = self.execute("{ actor { accounts { id } } }").await?;
        let accounts = data
            .pointer("/data/actor/accounts")
            .and_then(Value::as_array)
            .ok_or_else(|| unexpected("/data/actor/accounts"))?;
        let id = accounts
            .first()
            .and_then(|a| a.get("id"))
            .map(id_string)
            .ok_or_else(|| CoreError::Validation {
                field: "account-id".to_string(),
                message: "API key sees no accounts".to_string(),
            })?;
        info!(
            "found {} accounts, using {id}; set account-id to choose another",
            accounts.len()
        );
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Search for the project's dashboard.
    ///
    /// The name search also matches the dashboard's pages; the first entity
    /// returned is used, so a lone match is never an error.
    pub async fn find_dashboard(&self, project: &str) -> Result<Option<DashboardEntity>, CoreError> {
        let search = format!("name LIKE '%{}%'", dashboard_name(project));
        let entities = self.entity_search(&search).await?;
        Ok(entities.into_iter().next())
    }

    /// Create the dashboard from the template and wait for its permalink.
    pub async fn create_dashboard(&self, project: &str) -> Result<String, CoreError> {
        let template = self.template.as_deref().ok_or_else(|| {
            CoreError::Config("dashboard-template-path is not set".to_string())
        })?;
        let account_id = self.account_id().await?;
        let mutation = template
            .replace(PROJECT_PLACEHOLDER, &escape(project))
            .replace(ACCOUNT_PLACEHOLDER, &account_id);

        let data = self.execute(&mutation).await?;
        let guid = str_at(&data, "/data/dashboardCreate/entityResult/guid")?;
        info!("dashboard {:?} created ({guid})", dashboard_name(project));

        let search = format!("parentId ='{guid}'");
        for attempt in 0..=self.poll_attempts {
            tokio::time::sleep(self.poll_delay).await;
            match self.entity_search(&search).await {
                Ok(entities) => {
                    if let Some(entity) = entities.into_iter().next() {
                        *self.dashboard_guid.lock().await = Some(entity.guid);
                        return Ok(entity.permalink);
                    }
                }
                Err(e) => debug!("permalink lookup failed: {e}"),
            }
            if attempt < self.poll_attempts {
                warn!(
                    "permalink not ready yet, retrying in {:?} ({}/{})",
                    self.poll_delay,
                    attempt + 1,
                    self.poll_attempts
                );
            }
        }

        warn!("permalink still not ready, using {DEFAULT_DASHBOARDS_LINK}");
        Ok(DEFAULT_DASHBOARDS_LINK.to_string())
    }

    async fn entity_search(&self, search: &str) -> Result<Vec<DashboardEntity>, CoreError> {
        let query = format!(
            "{{ actor {{ entitySearch(query: \"{}\") {{ count results {{ entities {{ guid permalink }} }} }} }} }}",
            escape(search)
        );
        let data = self.execute(&query).await?;
        let count = data
            .pointer("/data/actor/entitySearch/count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if count == 0 {
            return Ok(Vec::new());
        }

        let entities = data
            .pointer("/data/actor/entitySearch/results/entities")
            .and_then(Value::as_array)
            .ok_or_else(|| unexpected("/data/actor/entitySearch/results/entities"))?;
        Ok(entities
            .iter()
            .filter_map(|e| {
                Some(DashboardEntity {
                    guid: e.get("guid")?.as_str()?.to_string(),
                    permalink: e.get("permalink")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn snapshot_url(
        &self,
        guid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<String>, CoreError> {
        let mutation = format!(
            "mutation {{ dashboardCreateSnapshotUrl(guid: \"{}\", params: {{ timeWindow: {{ beginTime: {}, endTime: {} }} }}) }}",
            escape(guid),
            start.timestamp_millis(),
            end.timestamp_millis()
        );
        let data = self.execute(&mutation).await?;
        Ok(data
            .pointer("/data/dashboardCreateSnapshotUrl")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn execute(&self, query: &str) -> Result<Value, CoreError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("API-Key", self.api_key.expose())
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("GraphQL request failed: {e}")))?;

        let status = resp.status().as_u16();
        if matches!(status, 401 | 403) {
            return Err(CoreError::AuthDelivery { status });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::FatalDelivery {
                status,
                message: format!("GraphQL endpoint: {text}"),
            });
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Internal(format!("GraphQL response parse failed: {e}")))?;
        if let Some(errors) = data.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() && data.get("data").map_or(true, Value::is_null) {
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect();
                return Err(CoreError::Internal(format!(
                    "GraphQL errors: {}",
                    messages.join("; ")
                )));
            }
        }
        Ok(data)
    }
}

#[async_trait]
impl DashboardProvider for GraphqlDashboard {
    async fn dashboard_link(&self, project: &str) -> Result<String, CoreError> {
        if let Some(entity) = self.find_dashboard(project).await? {
            info!("dashboard found: {}", dashboard_name(project));
            *self.dashboard_guid.lock().await = Some(entity.guid);
            return Ok(entity.permalink);
        }

        info!("no dashboard for project {project:?}, creating one");
        match self.create_dashboard(project).await {
            Ok(link) => Ok(link),
            Err(e) => {
                warn!(
                    "dashboard for {project:?} can't be created: {e}; check the template, \
                     API access and account-id. Using {DEFAULT_DASHBOARDS_LINK}"
                );
                Ok(DEFAULT_DASHBOARDS_LINK.to_string())
            }
        }
    }

    async fn static_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, CoreError> {
        let Some(guid) = self.dashboard_guid.lock().await.clone() else {
            warn!("no dashboard resolved, skipping static report");
            return Ok(None);
        };

        info!("static report requested, waiting {:?} for data to settle", self.poll_delay);
        tokio::time::sleep(self.poll_delay).await;

        let mut link = self.snapshot_url(&guid, start, end).await?;
        let mut remaining = self.poll_attempts;
        while link.is_none() && remaining > 0 {
            warn!("snapshot link not available, retrying in {:?}", self.poll_delay);
            remaining -= 1;
            tokio::time::sleep(self.poll_delay).await;
            link = self.snapshot_url(&guid, start, end).await?;
        }
        let Some(link) = link else {
            warn!("snapshot link was never issued, skipping static report");
            return Ok(None);
        };
        debug!("snapshot link {link}");

        let resp = self
            .client
            .get(&link)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CoreError::Network(format!("static report download failed: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CoreError::Network(format!("static report download failed: {e}")))?;

        let filename = format!("static_report_{}.pdf", Local::now().format("%Y-%m-%d-%H-%M-%S"));
        let path = self.report_dir.join(filename);
        tokio::fs::write(&path, &bytes).await?;
        info!("static report saved as {}", path.display());
        Ok(Some(path))
    }
}

/// Dashboard naming convention for a project
pub fn dashboard_name(project: &str) -> String {
    format!("Load Tests [{project}]")
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn str_at(data: &Value, pointer: &str) -> Result<String, CoreError> {
    data.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| unexpected(pointer))
}

fn unexpected(pointer: &str) -> CoreError {
    CoreError::Internal(format!("unexpected GraphQL response, missing {pointer}"))
}
