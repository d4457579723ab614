//! Source side of the sync protocol
//!
//! A [`Source`] turns a prior [`Checkpoint`] into a lazy stream of [`Page`]s.
//! The stream is pull-based: the runner polls for the next page only after
//! the previous page's commit cycle has completed, so a producer never
//! requests page N+1 before page N is durable.

use connsync_common::{Checkpoint, DataOp, EndUser, Operation, Result, StateOp};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Lazy, finite sequence of pages produced by one sync invocation
pub type PageStream<'a> = BoxStream<'a, Result<Page>>;

/// Extraction strategy a source supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every run re-reads everything
    FullRefresh,
    /// Runs resume from the cursor stored in the checkpoint
    Incremental,
}

/// Input handed to a source for one run
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub end_user: Option<EndUser>,
    /// Last persisted checkpoint, empty on the first run
    pub state: Checkpoint,
}

impl SourceContext {
    pub fn new(end_user: Option<EndUser>, state: Checkpoint) -> Self {
        Self { end_user, state }
    }

    /// Stored cursor for `stream`, if any
    pub fn cursor(&self, stream: &str) -> Option<&Value> {
        self.state.cursor(stream)
    }
}

/// One logical page of a source.
///
/// A page becomes `[data..., state?, commit]` on the wire. Keeping the state
/// as a single merged [`StateOp`] means a page can never carry two cursors for
/// the same stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    records: Vec<DataOp>,
    state: StateOp,
    skipped: usize,
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: DataOp) {
        self.records.push(op);
    }

    /// Convert `record` with [`DataOp::from_record`] and append it.
    ///
    /// Malformed records are skipped with a warning and counted instead of
    /// failing the page. Returns whether the record was kept.
    pub fn push_record(&mut self, stream: &str, id_field: &str, record: Value) -> bool {
        match DataOp::from_record(stream, id_field, record) {
            Ok(op) => {
                self.records.push(op);
                true
            },
            Err(err) => {
                warn!(stream, error = %err, "Skipping malformed record");
                self.skipped += 1;
                false
            },
        }
    }

    /// Record the resume cursor for `stream`; a later call for the same
    /// stream replaces the earlier one.
    pub fn set_state(&mut self, stream: impl Into<String>, cursor: Value) {
        self.state.payload.insert(stream.into(), cursor);
    }

    pub fn with_state(mut self, stream: impl Into<String>, cursor: Value) -> Self {
        self.set_state(stream, cursor);
        self
    }

    pub fn records(&self) -> &[DataOp] {
        &self.records
    }

    pub fn state(&self) -> &StateOp {
        &self.state
    }

    /// Number of malformed records dropped while building this page
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// True when the page carries neither data nor state
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.state.payload.is_empty()
    }

    /// Frame the page as operations: data in emission order, then the merged
    /// state (if any), then a commit barrier. An empty page frames to nothing,
    /// so no commit is ever emitted without progress.
    pub fn into_operations(self) -> Vec<Operation> {
        if self.is_empty() {
            return Vec::new();
        }

        let mut ops: Vec<Operation> = Vec::with_capacity(self.records.len() + 2);
        ops.extend(self.records.into_iter().map(Operation::Data));
        if !self.state.payload.is_empty() {
            ops.push(Operation::State(self.state));
        }
        ops.push(Operation::Commit);
        ops
    }
}

impl FromIterator<DataOp> for Page {
    fn from_iter<T: IntoIterator<Item = DataOp>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// A connector capable of producing records
pub trait Source: Send + Sync {
    /// Connector name used in logs, e.g. "rest_cursor"
    fn name(&self) -> &str;

    fn sync_mode(&self) -> SyncMode;

    /// Start one run. The returned stream is finite and not restartable; a
    /// new run must call `sync` again with the latest checkpoint.
    fn sync(&self, ctx: SourceContext) -> PageStream<'_>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_framing_order() {
        let mut page = Page::new();
        page.push(DataOp::new("account", "1", json!({"name": "Acme"})));
        page.push(DataOp::new("account", "2", json!({"name": "Globex"})));
        page.set_state("account", json!({"cursor": "1"}));
        page.set_state("account", json!({"cursor": "2"}));

        let ops = page.into_operations();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].type_name(), "data");
        assert_eq!(ops[1].type_name(), "data");
        assert_eq!(ops[2], Operation::state("account", json!({"cursor": "2"})));
        assert!(ops[3].is_commit());
    }

    #[test]
    fn test_empty_page_emits_no_commit() {
        assert!(Page::new().into_operations().is_empty());
    }

    #[test]
    fn test_state_only_page_still_commits() {
        let ops = Page::new().with_state("contact", json!({"cursor": null})).into_operations();
        assert_eq!(ops.len(), 2);
        assert!(ops[1].is_commit());
    }

    #[test]
    fn test_push_record_skips_malformed() {
        let mut page = Page::new();
        assert!(page.push_record("contact", "id", json!({"id": "c1"})));
        assert!(!page.push_record("contact", "id", json!({"email": "x@y.z"})));
        assert_eq!(page.records().len(), 1);
        assert_eq!(page.skipped(), 1);
    }
}
