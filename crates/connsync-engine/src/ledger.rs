//! Run history
//!
//! The scheduler records every finished run and asks the ledger when a
//! pipeline last succeeded to decide whether it is due.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::runner::RunResult;

/// One finished run
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: Uuid,
    pub pipeline_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: RunResult,
}

impl RunRecord {
    pub fn new(
        pipeline_id: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: RunResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline_id.into(),
            started_at,
            finished_at,
            result,
        }
    }
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Finish time of the latest successful run of `pipeline_id`
    async fn last_success(&self, pipeline_id: &str) -> anyhow::Result<Option<DateTime<Utc>>>;

    async fn record(&self, run: &RunRecord) -> anyhow::Result<()>;
}

/// Ledger stored in the `sync_runs` table
pub struct PgRunLedger {
    pool: PgPool,
}

impl PgRunLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLedger for PgRunLedger {
    async fn last_success(&self, pipeline_id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let finished: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT max(finished_at) FROM sync_runs
            WHERE pipeline_id = $1 AND error_kind IS NULL
            "#,
        )
        .bind(pipeline_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to read last run of pipeline '{}'", pipeline_id))?;

        Ok(finished)
    }

    async fn record(&self, run: &RunRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                id, pipeline_id, started_at, finished_at,
                records_processed, records_skipped, commits, error_kind, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(&run.pipeline_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(i64::try_from(run.result.records_processed).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.result.records_skipped).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.result.commits).unwrap_or(i64::MAX))
        .bind(run.result.error.map(|kind| kind.as_str()))
        .bind(run.result.error_message.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record run of pipeline '{}'", run.pipeline_id))?;

        Ok(())
    }
}

/// Ledger kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryRunLedger {
    runs: Arc<Mutex<HashMap<String, Vec<RunRecord>>>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<RunRecord>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs recorded for `pipeline_id`, oldest first
    pub fn runs(&self, pipeline_id: &str) -> Vec<RunRecord> {
        self.lock().get(pipeline_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn last_success(&self, pipeline_id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.lock().get(pipeline_id).and_then(|runs| {
            runs.iter()
                .filter(|run| run.result.is_success())
                .map(|run| run.finished_at)
                .max()
        }))
    }

    async fn record(&self, run: &RunRecord) -> anyhow::Result<()> {
        self.lock()
            .entry(run.pipeline_id.clone())
            .or_default()
            .push(run.clone());
        Ok(())
    }
}
