//! Per-collection batching of data operations between commit barriers

use connsync_common::{DataOp, EndUser, Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Destination-side context for one connector instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationContext {
    pub end_user: Option<EndUser>,
    /// Origin discriminator used when an operation carries no `source_id`
    pub source_id: Option<String>,
}

impl DestinationContext {
    pub fn new(end_user: Option<EndUser>, source_id: Option<String>) -> Self {
        Self { end_user, source_id }
    }
}

/// Row as written by an upsert writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRow {
    pub source_id: String,
    pub id: String,
    pub end_user_id: Option<String>,
    pub unified: Value,
    pub raw: Value,
}

impl UpsertRow {
    /// Composite identity the row is upserted on
    pub fn key(&self) -> (&str, &str) {
        (&self.source_id, &self.id)
    }

    /// Normalize a data operation into a row.
    ///
    /// An entity object that carries its own `raw` key is split into
    /// `unified` (its `unified` key, or the remaining fields) and `raw`.
    /// Any other entity is stored as `unified`, with `raw` taken from the
    /// operation or left as an empty object.
    pub fn from_op(op: DataOp, ctx: &DestinationContext) -> Self {
        let source_id = op
            .source_id
            .or_else(|| ctx.source_id.clone())
            .unwrap_or_default();
        let end_user_id = ctx.end_user.as_ref().map(|u| u.id.clone());

        let (unified, raw) = match op.entity {
            Value::Object(mut map) if map.contains_key("raw") => {
                let raw = map.remove("raw").unwrap_or(Value::Null);
                let unified = map.remove("unified").unwrap_or(Value::Object(map));
                (unified, raw)
            },
            entity => (entity, op.raw.unwrap_or_else(|| Value::Object(Map::new()))),
        };

        Self {
            source_id,
            id: op.id,
            end_user_id,
            unified,
            raw,
        }
    }
}

/// Pending rows of one destination collection, deduplicated by identity
#[derive(Debug, Clone, Default)]
pub struct CollectionBatch {
    rows: Vec<UpsertRow>,
    positions: HashMap<(String, String), usize>,
}

impl CollectionBatch {
    /// Append `row`, or replace the pending row with the same identity in
    /// place (last write wins, first position kept).
    fn upsert(&mut self, row: UpsertRow) {
        let key = (row.source_id.clone(), row.id.clone());
        match self.positions.get(&key) {
            Some(&idx) => self.rows[idx] = row,
            None => {
                self.positions.insert(key, self.rows.len());
                self.rows.push(row);
            },
        }
    }

    pub fn rows(&self) -> &[UpsertRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Pending batches keyed by collection name
pub type PendingBatches = BTreeMap<String, CollectionBatch>;

/// Buffers data operations per collection until the next commit
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    ctx: DestinationContext,
    batches: PendingBatches,
}

impl BatchAccumulator {
    pub fn new(ctx: DestinationContext) -> Self {
        Self {
            ctx,
            batches: PendingBatches::new(),
        }
    }

    pub fn context(&self) -> &DestinationContext {
        &self.ctx
    }

    /// Stage `op` in the batch of its stream's collection
    pub fn ingest(&mut self, op: DataOp) -> Result<()> {
        if op.stream.trim().is_empty() {
            return Err(SyncError::config(format!(
                "data operation '{}' has an empty stream name",
                op.id
            )));
        }

        let collection = op.stream.clone();
        let row = UpsertRow::from_op(op, &self.ctx);
        self.batches.entry(collection).or_default().upsert(row);
        Ok(())
    }

    /// Number of distinct rows waiting for the next flush
    pub fn pending(&self) -> usize {
        self.batches.values().map(CollectionBatch::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.values().all(CollectionBatch::is_empty)
    }

    pub fn batches(&self) -> &PendingBatches {
        &self.batches
    }

    /// Drop all pending rows; only called after a successful write
    pub fn clear(&mut self) {
        self.batches.clear();
    }
}
