//! Configuration loader and validator for the PlanIA diary sync tool.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub portal: Portal,
    #[serde(default)]
    pub dispatch: Dispatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Upstream PlanIA API that owns diaries and talks to the academic portal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Portal {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Pause between two sends of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            min_delay_ms: 1500,
            max_delay_ms: 4000,
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// SQLite URL for the local store, overridable through `DATABASE_URL`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/plania.db", self.app.resolved_data_dir()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.portal.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.base_url must be non-empty"));
    }
    if reqwest::Url::parse(cfg.portal.base_url.trim()).is_err() {
        return Err(ConfigError::Invalid("portal.base_url must be an absolute URL"));
    }
    if cfg.portal.token.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.token must be non-empty"));
    }
    if cfg.portal.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("portal.timeout_seconds must be > 0"));
    }

    if cfg.dispatch.min_delay_ms > cfg.dispatch.max_delay_ms {
        return Err(ConfigError::Invalid(
            "dispatch.min_delay_ms must not exceed dispatch.max_delay_ms",
        ));
    }

    Ok(())
}

/// Sample configuration file.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

portal:
  base_url: "http://localhost:3001/"
  token: "YOUR_PLANIA_API_TOKEN"
  timeout_seconds: 30

dispatch:
  min_delay_ms: 1500
  max_delay_ms: 4000
"#
}
