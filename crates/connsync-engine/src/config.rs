//! Configuration management
//!
//! Values come from, in increasing precedence: built-in defaults, a TOML file
//! (`CONNSYNC_CONFIG`, default `connsync.toml`), `DATABASE_URL`, and
//! `CONNSYNC_`-prefixed environment variables using `__` for nesting
//! (`CONNSYNC_SCHEDULER__MAX_CONCURRENT_RUNS=8`). A `.env` file is loaded
//! first when present.

use anyhow::Context;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::destination::postgres::DEFAULT_UPSERT_CHUNK_SIZE;
use crate::runner::{RunnerConfig, DEFAULT_MAX_PENDING_RECORDS};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CONNSYNC_CONFIG";

/// Config file used when `CONNSYNC_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "connsync.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CONNSYNC_";

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/connsync";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default scheduler tick (1 minute).
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Default minimum time between successful runs of a pipeline (24 hours).
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Default number of pipelines running at once.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
    pub destination: DestinationConfig,
    pub pipelines: Vec<PipelineConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Applies to pipelines without their own `sync_interval_secs`
    pub sync_interval_secs: u64,
    pub max_concurrent_runs: usize,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }
}

/// Settings shared by destination writers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Rows per INSERT statement for database destinations
    pub upsert_chunk_size: usize,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
        }
    }
}

/// One source -> destination pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Connector-instance id; also the checkpoint key
    pub id: String,
    #[serde(default)]
    pub end_user_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
    pub source: ConnectorConfig,
    pub destination: ConnectorConfig,
}

impl PipelineConfig {
    /// Effective interval between successful runs
    pub fn sync_interval(&self, scheduler: &SchedulerConfig) -> Duration {
        Duration::from_secs(self.sync_interval_secs.unwrap_or(scheduler.sync_interval_secs))
    }
}

/// Connector selection plus connector-specific settings.
///
/// `settings` stays untyped here; each connector deserializes its own shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Registered connector kind, e.g. "rest_cursor" or "postgres"
    pub kind: String,
    /// Origin discriminator stamped on written rows, e.g. "reso_crm_main"
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub settings: Value,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from `.env`, the config file and the environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    /// Load configuration using `path` as the config file (missing is fine)
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(
                Env::raw()
                    .only(&["DATABASE_URL"])
                    .map(|_| "database.url".into()),
            )
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate database URL
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        // Validate connection pool settings
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("Scheduler tick_interval_secs must be greater than 0");
        }

        if self.scheduler.max_concurrent_runs == 0 {
            anyhow::bail!("Scheduler max_concurrent_runs must be greater than 0");
        }

        if self.runner.max_pending_records == 0 {
            anyhow::bail!("Runner max_pending_records must be greater than 0");
        }

        if self.destination.upsert_chunk_size == 0 {
            anyhow::bail!("Destination upsert_chunk_size must be greater than 0");
        }

        // Pipeline ids double as checkpoint keys
        let mut ids = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.id.trim().is_empty() {
                anyhow::bail!("Pipeline id cannot be empty");
            }
            if !ids.insert(pipeline.id.as_str()) {
                anyhow::bail!("Duplicate pipeline id '{}'", pipeline.id);
            }
            if pipeline.source.kind.is_empty() || pipeline.destination.kind.is_empty() {
                anyhow::bail!("Pipeline '{}' needs a source and destination kind", pipeline.id);
            }
        }

        if self.pipelines.is_empty() {
            tracing::warn!("No pipelines configured");
        }

        if self.runner.max_pending_records > DEFAULT_MAX_PENDING_RECORDS * 10 {
            tracing::warn!(
                max_pending_records = self.runner.max_pending_records,
                "Very large pending record bound; pages are held in memory until commit"
            );
        }

        Ok(())
    }

    /// Look up a pipeline by id
    pub fn pipeline(&self, id: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.id == id)
    }
}
