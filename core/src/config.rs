use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};

/// Default number of task bodies allowed to run at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default chart stage used when a selection does not name one.
pub const DEFAULT_STAGE: &str = "prd";

/// Chartpack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Worker slots shared by every export/import task
    pub concurrency: usize,

    /// Root of the content-addressed download cache
    pub cache_dir: PathBuf,

    /// Helm chart repository endpoint (serves `index.yaml`)
    pub chart_repository: Option<String>,

    /// Stage used to locate charts when none is given
    pub stage: String,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cache_dir: default_cache_dir(),
            chart_repository: None,
            stage: DEFAULT_STAGE.to_string(),
            insecure_registries: Vec::new(),
            log_level: LogLevel::Warn,
        }
    }
}

impl PackConfig {
    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PackError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: PackConfig = serde_yaml::from_str(&content)?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(PackError::ConfigError(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.stage.is_empty() {
            return Err(PackError::ConfigError("stage must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Registries on the local machine, reached over plain HTTP without configuration.
pub fn is_loopback_registry(registry: &str) -> bool {
    let host = registry.split(':').next().unwrap_or(registry);
    host == "localhost" || host == "127.0.0.1"
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".chartpack"))
        .unwrap_or_else(|| PathBuf::from(".chartpack"))
        .join("cache")
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
