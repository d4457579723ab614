//! Pipeline runner
//!
//! Drives one connector instance from its stored checkpoint through a source
//! into a destination. For every page the runner:
//!
//! 1. Routes data operations into the destination in emission order
//! 2. Stages state operations over a copy of the persisted checkpoint
//! 3. On commit, flushes the destination and, only if that succeeded,
//!    persists the staged checkpoint when it changed
//! 4. Pulls the next page only after the commit cycle completed
//!
//! Errors never escape [`Runner::run`]; they are reported in [`RunResult`].

use connsync_common::{Checkpoint, EndUser, ErrorKind, Operation, Result, SyncError};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::destination::Destination;
use crate::source::{Source, SourceContext};

/// Default bound on rows buffered between two commits
pub const DEFAULT_MAX_PENDING_RECORDS: usize = 100_000;

/// Runner limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// A page staging more rows than this fails the run
    pub max_pending_records: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_pending_records: DEFAULT_MAX_PENDING_RECORDS,
        }
    }
}

/// The connector instance a run belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInstance {
    /// Checkpoint key
    pub id: String,
    pub end_user: Option<EndUser>,
}

impl SyncInstance {
    pub fn new(id: impl Into<String>, end_user: Option<EndUser>) -> Self {
        Self {
            id: id.into(),
            end_user,
        }
    }
}

/// Terminal status of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Data operations belonging to successfully committed pages
    pub records_processed: usize,
    /// Completed commit cycles
    pub commits: usize,
    /// Malformed records dropped by the source
    pub records_skipped: usize,
    pub error: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.error = Some(kind);
        self.error_message = Some(message.into());
    }
}

enum Completion {
    Exhausted,
    Cancelled,
}

/// Executes runs sequentially for one caller
#[derive(Debug, Clone, Default)]
pub struct Runner {
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token` for cooperative cancellation.
    ///
    /// Cancellation is honored while waiting for the next page and between
    /// commit cycles, never during a flush or checkpoint write.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    #[tracing::instrument(
        name = "sync_run",
        skip_all,
        fields(instance = %instance.id, source = source.name(), destination = destination.name())
    )]
    pub async fn run(
        &self,
        instance: &SyncInstance,
        source: &dyn Source,
        destination: &mut dyn Destination,
        store: &dyn CheckpointStore,
    ) -> RunResult {
        let mut result = RunResult::default();

        match self.drive(instance, source, destination, store, &mut result).await {
            Ok(Completion::Exhausted) => {
                info!(
                    records = result.records_processed,
                    commits = result.commits,
                    skipped = result.records_skipped,
                    "Sync run completed"
                );
            },
            Ok(Completion::Cancelled) => {
                result.fail(ErrorKind::Cancelled, "run cancelled");
                warn!(
                    records = result.records_processed,
                    commits = result.commits,
                    "Sync run cancelled"
                );
            },
            Err(err) => {
                let kind = err.kind();
                error!(
                    kind = %kind,
                    error = %err,
                    records = result.records_processed,
                    commits = result.commits,
                    "Sync run failed"
                );
                result.fail(kind, err.to_string());
            },
        }

        result
    }

    async fn drive(
        &self,
        instance: &SyncInstance,
        source: &dyn Source,
        destination: &mut dyn Destination,
        store: &dyn CheckpointStore,
        result: &mut RunResult,
    ) -> Result<Completion> {
        let mut persisted = store.get(&instance.id).await?.unwrap_or_default();
        let mut staged = persisted.clone();
        debug!(streams = persisted.as_map().len(), "Loaded checkpoint");

        let ctx = SourceContext::new(instance.end_user.clone(), persisted.clone());
        let mut pages = source.sync(ctx);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Completion::Cancelled);
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Completion::Cancelled),
                next = pages.next() => next,
            };
            let Some(page) = next else {
                return Ok(Completion::Exhausted);
            };
            let page = page?;

            result.records_skipped += page.skipped();
            let mut page_records = 0usize;

            for op in page.into_operations() {
                match op {
                    Operation::Data(op) => {
                        destination.ingest(op)?;
                        page_records += 1;
                        if destination.pending() > self.config.max_pending_records {
                            return Err(SyncError::config(format!(
                                "source '{}' buffered more than {} records without a commit",
                                source.name(),
                                self.config.max_pending_records
                            )));
                        }
                    },
                    Operation::State(state) => staged.apply(&state),
                    Operation::Commit => {
                        self.commit(instance, destination, store, &staged, &mut persisted)
                            .await?;
                        result.records_processed += page_records;
                        result.commits += 1;
                        page_records = 0;
                    },
                }
            }
        }
    }

    /// One commit cycle: flush, then persist the staged checkpoint.
    async fn commit(
        &self,
        instance: &SyncInstance,
        destination: &mut dyn Destination,
        store: &dyn CheckpointStore,
        staged: &Checkpoint,
        persisted: &mut Checkpoint,
    ) -> Result<()> {
        let written = destination.flush().await?;

        if staged != persisted {
            store.set(&instance.id, staged).await?;
            *persisted = staged.clone();
            debug!(rows = written, "Committed page and advanced checkpoint");
        } else {
            debug!(rows = written, "Committed page, checkpoint unchanged");
        }

        Ok(())
    }
}
