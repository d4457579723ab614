//! Connector registry
//!
//! Maps the `kind` of a pipeline's source and destination to concrete
//! connector values. Registered kinds:
//!
//! | kind          | source | destination | passthrough |
//! |---------------|--------|-------------|-------------|
//! | `rest_cursor` | yes    |             | yes         |
//! | `postgres`    | yes    | yes         |             |
//! | `memory`      |        | yes         |             |

use async_trait::async_trait;
use connsync_common::{EndUser, Result, SyncError};
use connsync_engine::config::{ConnectorConfig, DestinationConfig, PipelineConfig};
use connsync_engine::connector::Passthrough;
use connsync_engine::destination::{BatchDestination, Destination, DestinationContext, MemoryWriter};
use connsync_engine::scheduler::{BuiltPipeline, PipelineFactory};
use connsync_engine::source::Source;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::postgres::{self, PostgresDestinationSettings, PostgresSource, PostgresSourceSettings};
use crate::rest_cursor::{self, RestCursorSource};

/// Kind of the in-memory destination
pub const MEMORY_KIND: &str = "memory";

pub struct ConnectorRegistry {
    /// Engine database, used by Postgres destinations without their own URL
    pool: PgPool,
    destinations: DestinationConfig,
    /// Pools for connector databases other than the engine's, by URL
    pools: Mutex<HashMap<String, PgPool>>,
}

impl ConnectorRegistry {
    pub fn new(pool: PgPool, destinations: DestinationConfig) -> Self {
        Self {
            pool,
            destinations,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool_for(&self, url: Option<&str>) -> Result<PgPool> {
        let Some(url) = url else {
            return Ok(self.pool.clone());
        };

        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(url) {
            return Ok(pool.clone());
        }

        let pool = PgPool::connect_lazy(url)
            .map_err(|e| SyncError::config(format!("invalid database_url: {}", e)))?;
        pools.insert(url.to_string(), pool.clone());
        Ok(pool)
    }

    pub fn source(&self, config: &ConnectorConfig) -> Result<Box<dyn Source>> {
        match config.kind.as_str() {
            rest_cursor::KIND => Ok(Box::new(RestCursorSource::from_value(config.settings.clone())?)),
            postgres::KIND => {
                let settings = PostgresSourceSettings::from_value(config.settings.clone())?;
                let pool = self.pool_for(Some(&settings.database_url))?;
                Ok(Box::new(PostgresSource::new(pool, &settings)?))
            },
            other => Err(SyncError::config(format!("unknown source kind '{}'", other))),
        }
    }

    pub fn destination(&self, pipeline: &PipelineConfig) -> Result<Box<dyn Destination>> {
        let ctx = DestinationContext::new(
            pipeline.end_user_id.clone().map(EndUser::new),
            Some(source_id(pipeline)),
        );
        let config = &pipeline.destination;

        match config.kind.as_str() {
            postgres::KIND => {
                let settings = PostgresDestinationSettings::from_value(config.settings.clone())?;
                let pool = self.pool_for(settings.database_url.as_deref())?;
                Ok(Box::new(postgres::destination(
                    pool,
                    &settings,
                    ctx,
                    self.destinations.upsert_chunk_size,
                )?))
            },
            MEMORY_KIND => Ok(Box::new(BatchDestination::new(MEMORY_KIND, ctx, MemoryWriter::new()))),
            other => Err(SyncError::config(format!("unknown destination kind '{}'", other))),
        }
    }

    pub fn passthrough(&self, config: &ConnectorConfig) -> Result<Box<dyn Passthrough>> {
        match config.kind.as_str() {
            rest_cursor::KIND => Ok(Box::new(RestCursorSource::from_value(config.settings.clone())?)),
            other => Err(SyncError::config(format!(
                "connector kind '{}' does not support passthrough",
                other
            ))),
        }
    }
}

/// Origin stamped on rows, `reso_{connector}_{pipeline}` unless configured.
///
/// The connector segment is what the `connector_name` column extracts, so it
/// must not contain underscores.
pub fn source_id(pipeline: &PipelineConfig) -> String {
    pipeline.source.source_id.clone().unwrap_or_else(|| {
        format!("reso_{}_{}", pipeline.source.kind.replace('_', ""), pipeline.id)
    })
}

#[async_trait]
impl PipelineFactory for ConnectorRegistry {
    async fn build(&self, pipeline: &PipelineConfig) -> anyhow::Result<BuiltPipeline> {
        debug!(
            pipeline = %pipeline.id,
            source = %pipeline.source.kind,
            destination = %pipeline.destination.kind,
            "Building pipeline"
        );

        Ok(BuiltPipeline {
            source: self.source(&pipeline.source)?,
            destination: self.destination(pipeline)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn pipeline(source: ConnectorConfig, destination: ConnectorConfig) -> PipelineConfig {
        PipelineConfig {
            id: "crm_main".to_string(),
            end_user_id: Some("eu_1".to_string()),
            enabled: true,
            sync_interval_secs: None,
            source,
            destination,
        }
    }

    fn connector(kind: &str, settings: Value) -> ConnectorConfig {
        ConnectorConfig {
            kind: kind.to_string(),
            source_id: None,
            settings,
        }
    }

    fn registry() -> ConnectorRegistry {
        let pool = PgPool::connect_lazy("postgresql://localhost/connsync").unwrap();
        ConnectorRegistry::new(pool, DestinationConfig::default())
    }

    #[tokio::test]
    async fn test_builds_registered_kinds() {
        let registry = registry();
        let rest = connector(
            "rest_cursor",
            json!({"base_url": "https://api.example.com", "streams": ["contact"]}),
        );
        let p = pipeline(rest.clone(), connector("memory", Value::Null));

        let built = registry.build(&p).await.unwrap();
        assert_eq!(built.source.name(), "rest_cursor");
        assert_eq!(built.destination.name(), "memory");

        let pg = pipeline(
            connector("postgres", json!({"database_url": "postgresql://localhost/other"})),
            connector("postgres", json!({"schema": "synced"})),
        );
        let built = registry.build(&pg).await.unwrap();
        assert_eq!(built.source.name(), "postgres");
        assert_eq!(built.destination.name(), "postgres");

        assert!(registry.passthrough(&rest).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_kinds_are_config_errors() {
        let registry = registry();
        let err = registry.source(&connector("salesforce", Value::Null)).err().unwrap();
        assert_eq!(err.kind(), connsync_common::ErrorKind::FatalConfiguration);

        let p = pipeline(connector("rest_cursor", Value::Null), connector("s3", Value::Null));
        assert!(registry.destination(&p).is_err());
        assert!(registry.passthrough(&connector("postgres", Value::Null)).is_err());
    }

    #[test]
    fn test_source_id() {
        let mut p = pipeline(connector("rest_cursor", Value::Null), connector("memory", Value::Null));
        assert_eq!(source_id(&p), "reso_restcursor_crm_main");

        p.source.source_id = Some("reso_revert_1".to_string());
        assert_eq!(source_id(&p), "reso_revert_1");
    }
}
