//! Postgres upsert writer
//!
//! Every collection maps to one table keyed by `(source_id, id)`. Tables are
//! created on the first flush that references them. All collections of one
//! flush are written inside a single transaction.

use async_trait::async_trait;
use connsync_common::{Result, SyncError};
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{PendingBatches, UpsertWriter};

/// Rows per INSERT statement; 5 binds per row stays far below the 65535
/// parameter limit.
pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 1000;

/// Prefix of the advisory lock key serializing table DDL per schema
const DDL_LOCK_NAMESPACE: &str = "connsync_ddl";

/// Columns that get a secondary index on table creation
const INDEXED_COLUMNS: [&str; 6] = [
    "id",
    "source_id",
    "connector_name",
    "created_at",
    "updated_at",
    "end_user_id",
];

/// Upsert writer backed by a Postgres pool
pub struct PgUpsertWriter {
    pool: PgPool,
    schema: Option<String>,
    chunk_size: usize,
    /// Tables already ensured by this writer
    prepared: Mutex<HashSet<String>>,
}

impl PgUpsertWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: None,
            chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    /// Write into `schema` instead of the connection's search path
    pub fn with_schema(mut self, schema: &str) -> Result<Self> {
        self.schema = Some(identifier(schema)?);
        Ok(self)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn qualified(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, table),
            None => format!("\"{}\"", table),
        }
    }

    /// Create the table for `collection` unless this writer already did.
    async fn ensure_table(&self, collection: &str) -> Result<String> {
        let table = identifier(collection)?;
        let mut prepared = self.prepared.lock().await;
        if prepared.contains(&table) {
            return Ok(table);
        }

        info!(table = %table, schema = ?self.schema, "Ensuring destination table");
        self.setup_table(&table).await?;
        prepared.insert(table.clone());
        Ok(table)
    }

    /// Run the table DDL in one transaction holding an advisory lock keyed
    /// by schema, so concurrent writers in any process create a table once.
    async fn setup_table(&self, table: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(write_error)?;

        let lock_key = format!(
            "{}:{}",
            DDL_LOCK_NAMESPACE,
            self.schema.as_deref().unwrap_or("public")
        );
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&lock_key)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;

        if let Some(schema) = &self.schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema))
                .execute(&mut *tx)
                .await
                .map_err(write_error)?;
        }

        let qualified = self.qualified(table);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {qualified} (
                source_id VARCHAR NOT NULL,
                id VARCHAR NOT NULL,
                end_user_id VARCHAR,
                created_at TIMESTAMPTZ DEFAULT now() NOT NULL,
                updated_at TIMESTAMPTZ DEFAULT now() NOT NULL,
                connector_name VARCHAR GENERATED ALWAYS AS (split_part(source_id::text, '_', 2)) STORED NOT NULL,
                unified JSONB,
                raw JSONB DEFAULT '{{}}'::jsonb NOT NULL,
                CONSTRAINT "pk_{table}" PRIMARY KEY (source_id, id)
            )
            "#
        );
        sqlx::query(&ddl)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;

        for column in INDEXED_COLUMNS {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS \"{table}_{column}\" ON {qualified} (\"{column}\")"
            ))
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;
        }

        tx.commit().await.map_err(write_error)
    }
}

#[async_trait]
impl UpsertWriter for PgUpsertWriter {
    async fn write(&self, batches: &PendingBatches) -> Result<()> {
        let mut tables = Vec::with_capacity(batches.len());
        for (collection, batch) in batches {
            if !batch.is_empty() {
                tables.push((self.ensure_table(collection).await?, batch));
            }
        }

        let mut tx = self.pool.begin().await.map_err(write_error)?;
        let mut written = 0usize;

        for (table, batch) in &tables {
            for chunk in batch.rows().chunks(self.chunk_size) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "INSERT INTO {} (source_id, id, end_user_id, unified, raw) ",
                    self.qualified(table)
                ));
                builder.push_values(chunk, |mut b, row| {
                    b.push_bind(row.source_id.clone())
                        .push_bind(row.id.clone())
                        .push_bind(row.end_user_id.clone())
                        .push_bind(Json(row.unified.clone()))
                        .push_bind(Json(row.raw.clone()));
                });
                builder.push(
                    " ON CONFLICT (source_id, id) DO UPDATE SET \
                     end_user_id = EXCLUDED.end_user_id, \
                     unified = EXCLUDED.unified, \
                     raw = EXCLUDED.raw, \
                     updated_at = now()",
                );

                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(write_error)?;
                written += chunk.len();
            }
            debug!(table = %table, rows = batch.len(), "Upserted collection batch");
        }

        tx.commit().await.map_err(write_error)?;
        info!(rows = written, tables = tables.len(), "Committed upsert transaction");
        Ok(())
    }
}

fn write_error(err: sqlx::Error) -> SyncError {
    SyncError::destination(err.to_string())
}

/// Convert a collection or schema name into a safe snake_case identifier.
///
/// "BankAccount" -> "bank_account", "line-items" -> "line_items".
pub fn identifier(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;

    for c in name.trim().chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }

    let out = out.trim_matches('_').to_string();
    let starts_ok = out
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    // Postgres truncates identifiers at 63 bytes; leave room for index suffixes
    if !starts_ok || out.len() > 48 {
        return Err(SyncError::config(format!(
            "'{}' is not usable as a table name",
            name
        )));
    }

    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_snake_cases() {
        assert_eq!(identifier("account").unwrap(), "account");
        assert_eq!(identifier("BankAccount").unwrap(), "bank_account");
        assert_eq!(identifier("line-items").unwrap(), "line_items");
        assert_eq!(identifier("crm.contact").unwrap(), "crm_contact");
    }

    #[test]
    fn test_identifier_rejects_unusable_names() {
        assert!(identifier("").is_err());
        assert!(identifier("1099").is_err());
        assert!(identifier("\"; DROP TABLE x; --").is_err());
        assert!(identifier(&"a".repeat(80)).is_err());
    }

    #[tokio::test]
    async fn test_qualified_names() {
        let pool = PgPool::connect_lazy("postgresql://localhost/test").unwrap();
        let writer = PgUpsertWriter::new(pool.clone());
        assert_eq!(writer.qualified("account"), "\"account\"");

        let writer = PgUpsertWriter::new(pool).with_schema("Staging").unwrap();
        assert_eq!(writer.qualified("account"), "\"staging\".\"account\"");
    }
}
