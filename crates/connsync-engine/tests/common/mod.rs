//! Shared fixtures for engine integration tests
//!
//! - [`ScriptedSource`]: replays a fixed list of pages, failures and stalls
//! - [`CursorSource`]: pages over a fixed dataset and resumes from its cursor
//! - [`TestPostgres`]: PostgreSQL container with migrations applied

#![allow(dead_code)]

use anyhow::{Context, Result};
use connsync_common::{Checkpoint, DataOp, ErrorKind, SyncError};
use connsync_engine::destination::{BatchDestination, DestinationContext, MemoryWriter};
use connsync_engine::source::{Page, PageStream, Source, SourceContext, SyncMode};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,connsync_engine=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

pub fn account(id: &str, name: &str) -> DataOp {
    DataOp::new("account", id, json!({ "id": id, "name": name }))
}

/// Page of `ops` with an optional cursor for `stream`
pub fn page(ops: Vec<DataOp>, state: Option<(&str, Value)>) -> Page {
    let mut page: Page = ops.into_iter().collect();
    if let Some((stream, cursor)) = state {
        page.set_state(stream, cursor);
    }
    page
}

pub fn memory_destination(writer: &MemoryWriter) -> BatchDestination<MemoryWriter> {
    BatchDestination::new(
        "memory",
        DestinationContext::new(None, Some("reso_test".to_string())),
        writer.clone(),
    )
}

pub fn error_of(kind: ErrorKind) -> SyncError {
    match kind {
        ErrorKind::TransientSource => SyncError::transient("upstream returned 503"),
        ErrorKind::MalformedRecord => SyncError::malformed("account", "bad record"),
        ErrorKind::DestinationWrite => SyncError::destination("write failed"),
        ErrorKind::CheckpointPersist => SyncError::checkpoint("checkpoint failed"),
        ErrorKind::FatalConfiguration | ErrorKind::Cancelled => {
            SyncError::config("invalid credentials")
        },
    }
}

// ============================================================================
// Scripted Source
// ============================================================================

/// One step of a scripted run
#[derive(Debug, Clone)]
pub enum Step {
    Page(Page),
    /// Fail the page fetch with an error of this kind
    Fail(ErrorKind),
    /// Never produce the next page
    Hang,
}

/// Source that replays the same script on every `sync` call.
///
/// Records the checkpoint it was started with, and (when observing a writer)
/// how many flushes had completed each time a page was pulled.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    steps: Vec<Step>,
    contexts: Arc<Mutex<Vec<Checkpoint>>>,
    pulls: Arc<Mutex<Vec<usize>>>,
    observer: Option<MemoryWriter>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn pages(pages: Vec<Page>) -> Self {
        Self::new(pages.into_iter().map(Step::Page).collect())
    }

    pub fn observing(mut self, writer: &MemoryWriter) -> Self {
        self.observer = Some(writer.clone());
        self
    }

    /// Checkpoints passed to each `sync` call
    pub fn contexts(&self) -> Vec<Checkpoint> {
        self.contexts.lock().unwrap().clone()
    }

    /// Completed writes seen at each page pull
    pub fn pulls(&self) -> Vec<usize> {
        self.pulls.lock().unwrap().clone()
    }
}

impl Source for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn sync_mode(&self) -> SyncMode {
        SyncMode::Incremental
    }

    fn sync(&self, ctx: SourceContext) -> PageStream<'_> {
        self.contexts.lock().unwrap().push(ctx.state);
        let steps = self.steps.clone();

        Box::pin(async_stream::stream! {
            for step in steps {
                if let Some(writer) = &self.observer {
                    self.pulls.lock().unwrap().push(writer.write_count());
                }
                match step {
                    Step::Page(page) => yield Ok(page),
                    Step::Fail(kind) => {
                        yield Err(error_of(kind));
                        break;
                    },
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        })
    }
}

// ============================================================================
// Cursor Source
// ============================================================================

/// Source paging over `total` accounts with an `{"offset": n}` cursor.
///
/// `fail_at_page`, when set, makes the fetch of that page (0-based, counted
/// across all runs) fail with a transient error once.
pub struct CursorSource {
    total: usize,
    page_size: usize,
    fail_at_page: Mutex<Option<usize>>,
    fetched: AtomicUsize,
}

impl CursorSource {
    pub fn new(total: usize, page_size: usize) -> Self {
        Self {
            total,
            page_size,
            fail_at_page: Mutex::new(None),
            fetched: AtomicUsize::new(0),
        }
    }

    pub fn fail_at_page(self, page: usize) -> Self {
        *self.fail_at_page.lock().unwrap() = Some(page);
        self
    }

    fn should_fail(&self) -> bool {
        let n = self.fetched.fetch_add(1, Ordering::SeqCst);
        let mut fail_at = self.fail_at_page.lock().unwrap();
        if *fail_at == Some(n) {
            *fail_at = None;
            return true;
        }
        false
    }
}

impl Source for CursorSource {
    fn name(&self) -> &str {
        "cursor"
    }

    fn sync_mode(&self) -> SyncMode {
        SyncMode::Incremental
    }

    fn sync(&self, ctx: SourceContext) -> PageStream<'_> {
        let start = ctx
            .cursor("account")
            .and_then(|c| c["offset"].as_u64())
            .unwrap_or(0) as usize;

        Box::pin(async_stream::try_stream! {
            let mut offset = start;
            while offset < self.total {
                if self.should_fail() {
                    Err::<(), _>(SyncError::transient("rate limited"))?;
                }
                let end = (offset + self.page_size).min(self.total);
                let mut page = Page::new();
                for i in offset..end {
                    page.push(account(&format!("acc_{}", i), &format!("Account {}", i)));
                }
                page.set_state("account", json!({ "offset": end }));
                offset = end;
                yield page;
            }
        })
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("postgresql://postgres:postgres@{}:{}/postgres", host, port))
            .await
            .context("Failed to connect to PostgreSQL")?;

        connsync_engine::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
