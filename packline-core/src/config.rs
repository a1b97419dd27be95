//! Configuration file loading
//!
//! `packline.toml` is looked up in this order: an explicit path, the
//! `PACKLINE_CONFIG` environment variable, `./packline.toml`, then
//! `~/.packline/config.toml`. `DATABASE_URL` overrides `database.url`.
//!
//! ```toml
//! [database]
//! url = "mysql://ops@localhost:3306/warehouse"
//! max_connections = 10
//! acquire_timeout_secs = 30
//!
//! [pipeline]
//! statement_timeout_secs = 15
//!
//! [queries]
//! dir = "query"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::PipelineOptions;

pub const CONFIG_ENV: &str = "PACKLINE_CONFIG";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
const CONFIG_FILE_NAME: &str = "packline.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config not found (looked in {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacklineConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub queries: QueriesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// 0 disables idle reaping
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 0 disables connection recycling
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-operation deadline, unset for none
    pub statement_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueriesConfig {
    #[serde(default = "default_queries_dir")]
    pub dir: PathBuf,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_lifetime_secs() -> u64 {
    1800
}

fn default_queries_dir() -> PathBuf {
    PathBuf::from("query")
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            dir: default_queries_dir(),
        }
    }
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_secs > 0).then(|| Duration::from_secs(self.max_lifetime_secs))
    }
}

impl PipelineConfig {
    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            statement_timeout: self.statement_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl PacklineConfig {
    /// Locate and load the config file, then apply env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::locate(explicit)?;
        Self::load_from(&path)
    }

    /// Load a specific file, then apply env overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Ok(url) = env::var(DATABASE_URL_ENV) {
            if !url.is_empty() {
                config.database.url = url;
            }
        }

        // Relative query dirs are relative to the config file, not the cwd.
        if config.queries.dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.queries.dir = parent.join(&config.queries.dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Find the config file without reading it.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let candidates = Self::default_candidates();
        candidates
            .iter()
            .find(|p| p.exists())
            .cloned()
            .ok_or(ConfigError::NotFound {
                searched: candidates,
            })
    }

    fn default_candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".packline").join("config.toml"));
        }
        candidates
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: format!("database.url is empty (set it or {DATABASE_URL_ENV})"),
            });
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                reason: "database.max_connections must be at least 1".to_string(),
            });
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Invalid {
                reason: "database.min_connections exceeds max_connections".to_string(),
            });
        }
        if self.pipeline.statement_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid {
                reason: "pipeline.statement_timeout_secs must be positive".to_string(),
            });
        }
        Ok(())
    }
}
