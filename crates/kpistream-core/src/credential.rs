//! Credential resolution.
//!
//! A credential is looked up from an environment variable, a literal config value
//! and a file, in that order; the first populated source wins.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::ReporterConfig;
use crate::error::CoreError;

/// Environment variable holding the Metric API insert key
pub const INSERT_KEY_ENV: &str = "NEW_RELIC_INSERT_KEY";

/// Environment variable holding the NerdGraph user API key
pub const API_KEY_ENV: &str = "NEW_RELIC_API_KEY";

/// Shortest secret that keeps its last four characters visible when masked
const MIN_PARTIAL_MASK_LEN: usize = 8;

/// Where a credential came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Environment(String),
    Config,
    File(PathBuf),
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Environment(var) => write!(f, "environment variable {var}"),
            CredentialSource::Config => write!(f, "config file"),
            CredentialSource::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// A resolved secret. `Debug` and `Display` print it masked.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
    source: CredentialSource,
}

impl Credential {
    pub fn new(secret: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            secret: secret.into(),
            source,
        }
    }

    /// The raw secret, for request headers only.
    pub fn expose(&self) -> &str {
        &self.secret
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// All but the last four characters replaced with `*`; secrets of
    /// eight characters or fewer are masked entirely.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.secret.chars().collect();
        if chars.len() <= MIN_PARTIAL_MASK_LEN {
            return "*".repeat(chars.len().max(4));
        }
        let visible: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{visible}", "*".repeat(chars.len() - 4))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &self.masked())
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (from {})", self.masked(), self.source)
    }
}

/// Ordered chain of credential sources.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    kind: &'static str,
    env_var: String,
    literal: Option<String>,
    file: Option<PathBuf>,
}

impl CredentialResolver {
    pub fn new(
        kind: &'static str,
        env_var: impl Into<String>,
        literal: Option<String>,
        file: Option<PathBuf>,
    ) -> Self {
        Self {
            kind,
            env_var: env_var.into(),
            literal,
            file,
        }
    }

    /// Resolver for the Metric API insert key (`token`, `token-file`).
    pub fn insert_key(config: &ReporterConfig) -> Self {
        Self::new(
            "insert key",
            INSERT_KEY_ENV,
            config.token.clone(),
            config.token_file.clone(),
        )
    }

    /// Resolver for the dashboard API key (`api-token`, `api-token-file`).
    pub fn api_key(config: &ReporterConfig) -> Self {
        Self::new(
            "API key",
            API_KEY_ENV,
            config.api_token.clone(),
            config.api_token_file.clone(),
        )
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<Credential, CoreError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with<F>(&self, env: F) -> Result<Credential, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credential = self
            .from_env(&env)
            .or_else(|| self.from_literal())
            .or_else(|| self.from_file())
            .ok_or_else(|| {
                CoreError::CredentialMissing(format!(
                    "{} not found in {}, config or file",
                    self.kind, self.env_var
                ))
            })?;

        info!("{} found in {}: {}", self.kind, credential.source(), credential.masked());
        Ok(credential)
    }

    fn from_env<F>(&self, env: &F) -> Option<Credential>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = non_empty(env(&self.env_var));
        if value.is_none() {
            debug!("{} not set in {}", self.kind, self.env_var);
        }
        value.map(|v| Credential::new(v, CredentialSource::Environment(self.env_var.clone())))
    }

    fn from_literal(&self) -> Option<Credential> {
        non_empty(self.literal.clone()).map(|v| Credential::new(v, CredentialSource::Config))
    }

    fn from_file(&self) -> Option<Credential> {
        let path = self.file.as_deref()?;
        let value = read_trimmed(path)
            .map_err(|e| {
                warn!(
                    "{} can't be read from {}: {e}, check path or access",
                    self.kind,
                    path.display()
                )
            })
            .ok()?;
        non_empty(Some(value)).map(|v| Credential::new(v, CredentialSource::File(path.to_path_buf())))
    }
}

/// Resolve the insert key for a session.
pub fn resolve(config: &ReporterConfig) -> Result<Credential, CoreError> {
    CredentialResolver::insert_key(config).resolve()
}

fn read_trimmed(path: &Path) -> Result<String, CoreError> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
