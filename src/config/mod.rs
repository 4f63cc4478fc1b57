//! Configuration management.
//!
//! itemflow configuration can come from:
//! - Environment variables (ITEMFLOW_*)
//! - Config file (~/.config/itemflow/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// itemflow configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Engine defaults
    #[serde(default)]
    pub engine: EngineConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Engine defaults, applied where a workflow or node does not say otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run wall-clock budget when the workflow sets none (0 = unlimited)
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,

    /// Per-invocation node timeout when the node sets none
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Cap on any single retry delay when the node sets none
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Upper bound on concurrent node executions within one run
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Upper bound on loop revisits, whatever the workflow asks for
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: default_run_timeout_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_concurrency: default_max_concurrency(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

fn default_run_timeout_ms() -> u64 {
    3_600_000
}

fn default_node_timeout_ms() -> u64 {
    300_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_max_concurrency() -> usize {
    16
}

fn default_max_loop_iterations() -> u32 {
    10_000
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_ms > 0).then(|| Duration::from_millis(self.run_timeout_ms))
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms.max(1))
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Parse a config file's contents (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let partial: PartialConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        let mut config = Self::default();
        config.apply_partial(partial);
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("itemflow"))
            .unwrap_or_else(|| PathBuf::from(".itemflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("itemflow"))
            .unwrap_or_else(|| PathBuf::from(".itemflow"))
    }

    /// Database path, falling back to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("itemflow.db"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("ITEMFLOW_RUN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.engine.run_timeout_ms = v;
        }
        if let Some(v) = get("ITEMFLOW_NODE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.engine.node_timeout_ms = v;
        }
        if let Some(v) = get("ITEMFLOW_MAX_RETRY_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.engine.max_retry_delay_ms = v;
        }
        if let Some(v) = get("ITEMFLOW_MAX_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.engine.max_concurrency = v;
        }
        if let Some(v) = get("ITEMFLOW_MAX_LOOP_ITERATIONS").and_then(|v| v.parse().ok()) {
            self.engine.max_loop_iterations = v;
        }
        if let Some(path) = get("ITEMFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    engine: Option<EngineConfig>,
    storage: Option<StorageConfig>,
}
