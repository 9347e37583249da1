//! Daemon configuration: YAML file plus `MICROCI_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of environment variables that override file values.
pub const ENV_PREFIX: &str = "MICROCI_";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Config file is not valid YAML for [`Config`].
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },
    /// An environment override could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },
    /// Semantic validation failed.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server.
    pub server: ServerConfig,
    /// Gitea instance the commit statuses go to.
    pub gitea: GiteaConfig,
    /// Job storage and execution.
    pub jobs: JobsConfig,
    /// User scripts.
    pub scripts: ScriptsConfig,
    /// Directory holding `scripts/prepare-*.sh`.
    pub resource_dir: PathBuf,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public base URL, used for commit status links.
    pub address: String,
    /// Interface to bind.
    pub bind_address: String,
    /// Port to bind.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8080".into(),
            bind_address: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// Gitea API settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GiteaConfig {
    /// Base URL, e.g. `https://git.example.org`.
    pub url: String,
    /// Webhook secret. Empty disables signature checks.
    pub secret_key: String,
    /// API token. Preferred over username/password.
    pub token: String,
    /// Basic auth user.
    pub username: String,
    /// Basic auth password.
    pub password: String,
}

/// Job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Root directory of job folders.
    pub folder: PathBuf,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Per-script deadline in seconds.
    pub max_execution_time_secs: u64,
    /// Cancel the previous job of a queue when a new one arrives.
    pub cancel_previous: bool,
    /// Commit status context when the webhook does not name one.
    pub default_context: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("jobs"),
            workers: 1,
            max_execution_time_secs: 3600,
            cancel_previous: false,
            default_context: "microci".into(),
        }
    }
}

impl JobsConfig {
    /// Per-script deadline.
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs)
    }
}

/// Script lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Root of `<owner>/<repo>/[<branch>/]<script>` trees.
    pub folder: PathBuf,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("scripts"),
        }
    }
}

impl Config {
    /// Loads `path` (defaults when it does not exist), applies environment
    /// overrides and validates the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        cfg.apply_env(std::env::vars())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `MICROCI_<SECTION>_<FIELD>` overrides. Unknown names are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "SERVER_ADDRESS" => self.server.address = value,
                "SERVER_BIND_ADDRESS" => self.server.bind_address = value,
                "SERVER_PORT" => self.server.port = parse_env(&name, value)?,
                "GITEA_URL" => self.gitea.url = value,
                "GITEA_SECRET_KEY" => self.gitea.secret_key = value,
                "GITEA_TOKEN" => self.gitea.token = value,
                "GITEA_USERNAME" => self.gitea.username = value,
                "GITEA_PASSWORD" => self.gitea.password = value,
                "JOBS_FOLDER" => self.jobs.folder = value.into(),
                "JOBS_WORKERS" => self.jobs.workers = parse_env(&name, value)?,
                "JOBS_MAX_EXECUTION_TIME_SECS" => {
                    self.jobs.max_execution_time_secs = parse_env(&name, value)?
                }
                "JOBS_CANCEL_PREVIOUS" => self.jobs.cancel_previous = parse_env(&name, value)?,
                "JOBS_DEFAULT_CONTEXT" => self.jobs.default_context = value,
                "SCRIPTS_FOLDER" => self.scripts.folder = value.into(),
                "RESOURCE_DIR" => self.resource_dir = value.into(),
                _ => {}
            }
        }
        Ok(())
    }

    /// Checks cross-field constraints and fills derived defaults.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.jobs.workers == 0 {
            return Err(ConfigError::Invalid(
                "jobs.workers must be at least one".into(),
            ));
        }
        if self.jobs.max_execution_time_secs == 0 {
            return Err(ConfigError::Invalid(
                "jobs.max_execution_time_secs must be positive".into(),
            ));
        }
        if self.gitea.url.trim().is_empty() {
            return Err(ConfigError::Invalid("gitea.url is required".into()));
        }
        if self.gitea.token.is_empty() && self.gitea.username.is_empty() {
            return Err(ConfigError::Invalid(
                "either gitea.token or gitea.username is required".into(),
            ));
        }
        if self.resource_dir.as_os_str().is_empty() {
            self.resource_dir = PathBuf::from(".");
        }
        let trimmed = self.server.address.trim_end_matches('/').len();
        self.server.address.truncate(trimmed);
        Ok(())
    }

    /// `bind_address:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value,
    })
}
