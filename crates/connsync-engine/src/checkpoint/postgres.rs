//! Postgres checkpoint store backed by the `sync_checkpoints` table

use async_trait::async_trait;
use connsync_common::{Checkpoint, Result, SyncError};
use sqlx::{types::Json, PgPool};
use tracing::debug;

use super::CheckpointStore;

/// Checkpoint store keeping one JSONB row per connector instance
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn persist_error(err: sqlx::Error) -> SyncError {
    SyncError::checkpoint(err.to_string())
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, instance: &str) -> Result<Option<Checkpoint>> {
        let row: Option<(Json<Checkpoint>,)> =
            sqlx::query_as("SELECT state FROM sync_checkpoints WHERE instance_id = $1")
                .bind(instance)
                .fetch_optional(&self.pool)
                .await
                .map_err(persist_error)?;

        Ok(row.map(|(Json(checkpoint),)| checkpoint))
    }

    async fn set(&self, instance: &str, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (instance_id, state)
            VALUES ($1, $2)
            ON CONFLICT (instance_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = now()
            "#,
        )
        .bind(instance)
        .bind(Json(checkpoint))
        .execute(&self.pool)
        .await
        .map_err(persist_error)?;

        debug!(instance, streams = checkpoint.as_map().len(), "Checkpoint stored");
        Ok(())
    }

    async fn delete(&self, instance: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_checkpoints WHERE instance_id = $1")
            .bind(instance)
            .execute(&self.pool)
            .await
            .map_err(persist_error)?;

        Ok(result.rows_affected() > 0)
    }
}
