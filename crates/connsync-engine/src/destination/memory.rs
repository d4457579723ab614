//! In-process upsert writer
//!
//! Keeps collections in memory with the same identity and atomicity rules as
//! the Postgres writer. Used for dry runs and tests; supports injecting write
//! failures.

use async_trait::async_trait;
use connsync_common::{Result, SyncError};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{PendingBatches, UpsertWriter};

/// Row as stored by [`MemoryWriter`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub source_id: String,
    pub id: String,
    pub end_user_id: Option<String>,
    pub unified: Value,
    pub raw: Value,
    /// How many times this identity has been written
    pub writes: u64,
}

type Table = BTreeMap<(String, String), StoredRow>;

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    fail_next: usize,
    fail_collections: HashSet<String>,
    write_count: usize,
}

/// Cloneable handle to a shared in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    state: Arc<Mutex<State>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` writes fail before touching any collection
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Make every write that includes `collection` fail
    pub fn fail_on_collection(&self, collection: impl Into<String>) {
        self.lock().fail_collections.insert(collection.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_next = 0;
        state.fail_collections.clear();
    }

    /// Number of successful writes
    pub fn write_count(&self) -> usize {
        self.lock().write_count
    }

    pub fn collections(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.lock().tables.get(collection).map_or(0, BTreeMap::len)
    }

    /// Rows of `collection` ordered by `(source_id, id)`
    pub fn rows(&self, collection: &str) -> Vec<StoredRow> {
        self.lock()
            .tables
            .get(collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, collection: &str, source_id: &str, id: &str) -> Option<StoredRow> {
        self.lock()
            .tables
            .get(collection)
            .and_then(|t| t.get(&(source_id.to_string(), id.to_string())))
            .cloned()
    }
}

#[async_trait]
impl UpsertWriter for MemoryWriter {
    async fn write(&self, batches: &PendingBatches) -> Result<()> {
        let mut state = self.lock();

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SyncError::destination("injected write failure"));
        }

        // Apply to a copy and swap it in only when every collection succeeded.
        let mut tables = state.tables.clone();
        for (collection, batch) in batches {
            if batch.is_empty() {
                continue;
            }
            if state.fail_collections.contains(collection) {
                return Err(SyncError::destination(format!(
                    "injected write failure for collection '{}'",
                    collection
                )));
            }

            let table = tables.entry(collection.clone()).or_default();
            for row in batch.rows() {
                let key = (row.source_id.clone(), row.id.clone());
                let writes = table.get(&key).map_or(0, |r| r.writes) + 1;
                table.insert(
                    key,
                    StoredRow {
                        source_id: row.source_id.clone(),
                        id: row.id.clone(),
                        end_user_id: row.end_user_id.clone(),
                        unified: row.unified.clone(),
                        raw: row.raw.clone(),
                        writes,
                    },
                );
            }
        }

        state.tables = tables;
        state.write_count += 1;
        Ok(())
    }
}
