//! Postgres connector
//!
//! As a source it reads two kinds of streams:
//!
//! - **Entity tables** (`account`, `transaction` by default) written by the
//!   Postgres destination, re-read in full for the run's end user and paged
//!   by `(source_id, id)`.
//! - **Source queries**: per-stream SQL templates run against the database
//!   and resumed from a `{lastModifiedAt, lastRowId}` cursor taken from the
//!   last row of each page.
//!   Queries that ignore the cursor, or whose rows carry none, are paged by
//!   offset within the run and re-read in full on the next one.
//!
//! As a destination it is the engine's [`PgUpsertWriter`] behind a
//! [`BatchDestination`].

use connsync_common::{DataOp, Result, SyncError};
use connsync_engine::destination::postgres::identifier;
use connsync_engine::destination::{BatchDestination, DestinationContext, PgUpsertWriter};
use connsync_engine::source::{Page, PageStream, Source, SourceContext, SyncMode};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Kind name used in pipeline configuration
pub const KIND: &str = "postgres";

const DEFAULT_PAGE_SIZE: usize = 500;

fn default_entities() -> Vec<String> {
    vec!["account".to_string(), "transaction".to_string()]
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Source settings
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSourceSettings {
    pub database_url: String,
    /// Entity tables re-read in full on every run
    #[serde(default = "default_entities")]
    pub entities: Vec<String>,
    /// Stream name -> SQL template
    #[serde(default)]
    pub source_queries: BTreeMap<String, String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl PostgresSourceSettings {
    pub fn from_value(settings: Value) -> Result<Self> {
        serde_json::from_value(settings)
            .map_err(|e| SyncError::config(format!("invalid postgres source settings: {}", e)))
    }
}

/// Destination settings
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresDestinationSettings {
    /// Falls back to the engine database when absent
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
}

impl PostgresDestinationSettings {
    pub fn from_value(settings: Value) -> Result<Self> {
        if settings.is_null() {
            return Ok(Self {
                database_url: None,
                schema: None,
            });
        }
        serde_json::from_value(settings)
            .map_err(|e| SyncError::config(format!("invalid postgres destination settings: {}", e)))
    }
}

/// Build a Postgres destination writing through `pool`
pub fn destination(
    pool: PgPool,
    settings: &PostgresDestinationSettings,
    ctx: DestinationContext,
    chunk_size: usize,
) -> Result<BatchDestination<PgUpsertWriter>> {
    let mut writer = PgUpsertWriter::new(pool).with_chunk_size(chunk_size);
    if let Some(schema) = &settings.schema {
        writer = writer.with_schema(schema)?;
    }
    Ok(BatchDestination::new(KIND, ctx, writer))
}

/// SQL template with `{{name}}` placeholders.
///
/// Known placeholders are `lastModifiedAt` and `lastRowId` from the stream's
/// cursor and `endUserId` from the run. Unknown or missing values render as
/// an empty string. Single quotes in values are doubled, so templates quote
/// placeholders as string literals, e.g. `WHERE modified_at > '{{lastModifiedAt}}'`.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    stream: String,
    sql: String,
    placeholder: Regex,
}

impl QueryTemplate {
    pub fn new(stream: impl Into<String>, sql: impl Into<String>) -> Result<Self> {
        let placeholder = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
            .map_err(|e| SyncError::config(e.to_string()))?;
        Ok(Self {
            stream: stream.into(),
            sql: sql.into(),
            placeholder,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Substitute placeholders. An empty result is a configuration error.
    pub fn render(&self, vars: &Map<String, Value>) -> Result<String> {
        let rendered = self.placeholder.replace_all(&self.sql, |caps: &regex::Captures| {
            let value = match vars.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            // Values land inside SQL string literals
            value.replace('\'', "''")
        });

        let rendered = rendered.trim().trim_end_matches(';').trim().to_string();
        if rendered.is_empty() {
            return Err(SyncError::config(format!(
                "source query for stream '{}' rendered to an empty statement",
                self.stream
            )));
        }
        Ok(rendered)
    }
}

/// Template variables for one render: the stream cursor plus `endUserId`
fn query_vars(cursor: Option<&Value>, end_user_id: Option<&str>) -> Map<String, Value> {
    let mut vars = match cursor {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    vars.insert(
        "endUserId".to_string(),
        end_user_id.map_or(Value::Null, |id| Value::String(id.to_string())),
    );
    vars
}

/// Cursor after the last row of a page, if the row carries one
fn row_cursor(row: &Value) -> Option<Value> {
    let modified = row.get("modifiedAt").filter(|v| !v.is_null())?;
    let id = row.get("id").filter(|v| !v.is_null())?;
    let id = match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(json!({ "lastModifiedAt": modified, "lastRowId": id }))
}

/// Source reading entity tables and templated queries
pub struct PostgresSource {
    pool: PgPool,
    entities: Vec<String>,
    queries: Vec<QueryTemplate>,
    page_size: usize,
}

impl PostgresSource {
    pub fn new(pool: PgPool, settings: &PostgresSourceSettings) -> Result<Self> {
        if settings.page_size == 0 {
            return Err(SyncError::config("postgres source page_size must be greater than 0"));
        }

        let entities = settings
            .entities
            .iter()
            .map(String::as_str)
            .map(identifier)
            .collect::<Result<Vec<_>>>()?;
        let queries = settings
            .source_queries
            .iter()
            .map(|(stream, sql)| QueryTemplate::new(stream.clone(), sql.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pool,
            entities,
            queries,
            page_size: settings.page_size,
        })
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(read_error)?;
        Ok(exists)
    }

    /// One keyset page of an entity table
    async fn entity_page(
        &self,
        table: &str,
        end_user_id: Option<&str>,
        after: &(String, String),
    ) -> Result<Vec<(String, String, Option<Value>, Option<Value>)>> {
        let sql = format!(
            r#"
            SELECT source_id, id, unified, raw FROM "{table}"
            WHERE end_user_id IS NOT DISTINCT FROM $1
              AND (source_id, id) > ($2, $3)
            ORDER BY source_id, id
            LIMIT $4
            "#
        );
        sqlx::query_as(&sql)
            .bind(end_user_id)
            .bind(&after.0)
            .bind(&after.1)
            .bind(self.page_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(read_error)
    }

    async fn query_page(&self, sql: &str, offset: usize) -> Result<Vec<Value>> {
        let wrapped = format!(
            "SELECT row_to_json(q)::jsonb FROM ({}) q LIMIT {} OFFSET {}",
            sql, self.page_size, offset
        );
        sqlx::query_scalar(&wrapped)
            .fetch_all(&self.pool)
            .await
            .map_err(read_error)
    }
}

/// SQLSTATE classes worth retrying: connection exceptions (08),
/// transaction rollbacks such as deadlocks (40), insufficient resources (53),
/// operator intervention (57) and system errors (58).
const TRANSIENT_SQLSTATE_CLASSES: [&str; 5] = ["08", "40", "53", "57", "58"];

fn is_transient_sqlstate(code: &str) -> bool {
    TRANSIENT_SQLSTATE_CLASSES
        .iter()
        .any(|class| code.starts_with(class))
}

/// Database errors are classified by SQLSTATE; anything else (I/O, pool
/// timeouts, protocol) is transient.
fn read_error(err: sqlx::Error) -> SyncError {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let message = format!("query failed ({}): {}", code, db);
            if is_transient_sqlstate(&code) {
                SyncError::transient(message)
            } else {
                SyncError::config(message)
            }
        },
        other => SyncError::transient(other.to_string()),
    }
}

impl Source for PostgresSource {
    fn name(&self) -> &str {
        KIND
    }

    fn sync_mode(&self) -> SyncMode {
        if self.queries.is_empty() {
            SyncMode::FullRefresh
        } else {
            SyncMode::Incremental
        }
    }

    fn sync(&self, ctx: SourceContext) -> PageStream<'_> {
        Box::pin(async_stream::try_stream! {
            let end_user_id = ctx.end_user.as_ref().map(|u| u.id.clone());

            for table in &self.entities {
                if !self.table_exists(table).await? {
                    debug!(table = %table, "Entity table missing, skipping");
                    continue;
                }

                let mut after = (String::new(), String::new());
                loop {
                    let rows = self.entity_page(table, end_user_id.as_deref(), &after).await?;
                    let full = rows.len() == self.page_size;
                    if let Some((source_id, id, _, _)) = rows.last() {
                        after = (source_id.clone(), id.clone());
                    }

                    let page: Page = rows
                        .into_iter()
                        .map(|(source_id, id, unified, raw)| {
                            DataOp::new(table.clone(), id, unified.unwrap_or(Value::Null))
                                .with_raw(raw.unwrap_or_else(|| json!({})))
                                .with_source_id(source_id)
                        })
                        .collect();
                    debug!(table = %table, rows = page.records().len(), "Read entity page");
                    yield page;

                    if !full {
                        break;
                    }
                }
            }

            for query in &self.queries {
                let stream = query.stream();
                let mut cursor = ctx.cursor(stream).cloned();
                info!(stream, resume = cursor.is_some(), "Running source query");

                let mut sql = query.render(&query_vars(cursor.as_ref(), end_user_id.as_deref()))?;
                let mut offset = 0usize;

                loop {
                    let rows = self.query_page(&sql, offset).await?;
                    let full = rows.len() == self.page_size;
                    let next = rows.last().and_then(row_cursor);

                    let mut page = Page::new();
                    for row in rows {
                        page.push_record(stream, "id", row);
                    }
                    if let Some(next) = &next {
                        page.set_state(stream, next.clone());
                    }
                    yield page;

                    if !full {
                        break;
                    }
                    if next.is_some() {
                        cursor = next;
                    }

                    // A template that reads the cursor restarts from it; one
                    // that renders the same statement pages by offset.
                    let rendered = query.render(&query_vars(cursor.as_ref(), end_user_id.as_deref()))?;
                    if rendered == sql {
                        offset += self.page_size;
                    } else {
                        sql = rendered;
                        offset = 0;
                    }
                    debug!(stream, offset, "Reading next query page");
                }
            }
        })
    }
}
