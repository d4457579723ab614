//! Shared protocol types
//!
//! [`Operation`] is the unit that flows from a source to a destination.
//! [`Checkpoint`] is the per-stream cursor mapping persisted between runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, SyncError};

/// One logical record observed from a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOp {
    /// Stream (entity category) the record belongs to, e.g. "account"
    pub stream: String,
    /// Source-side identifier, unique within the stream and origin
    pub id: String,
    /// Normalized record content
    pub entity: Value,
    /// Original payload as returned by the source, if kept separately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    /// Origin discriminator, part of the composite identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl DataOp {
    pub fn new(stream: impl Into<String>, id: impl Into<String>, entity: Value) -> Self {
        Self {
            stream: stream.into(),
            id: id.into(),
            entity,
            raw: None,
            source_id: None,
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Build a data operation from a JSON record, reading its identifier from
    /// `id_field`. Numeric ids are stringified.
    ///
    /// Fails with [`SyncError::MalformedRecord`] when the record is not an
    /// object or has no usable identifier.
    pub fn from_record(stream: &str, id_field: &str, record: Value) -> Result<Self> {
        let Some(object) = record.as_object() else {
            return Err(SyncError::malformed(stream, "record is not a JSON object"));
        };

        let id = match object.get(id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(_)) => {
                return Err(SyncError::malformed(stream, format!("empty '{}' field", id_field)))
            },
            _ => {
                return Err(SyncError::malformed(
                    stream,
                    format!("missing '{}' field", id_field),
                ))
            },
        };

        Ok(Self::new(stream, id, record))
    }
}

/// Resumability checkpoint emitted by a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateOp {
    /// Cursor per stream; each entry replaces the stored cursor of that stream
    pub payload: BTreeMap<String, Value>,
}

impl StateOp {
    pub fn new(payload: BTreeMap<String, Value>) -> Self {
        Self { payload }
    }

    /// State update touching a single stream
    pub fn for_stream(stream: impl Into<String>, cursor: Value) -> Self {
        let mut payload = BTreeMap::new();
        payload.insert(stream.into(), cursor);
        Self { payload }
    }
}

/// Operation flowing through a sync pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Data(DataOp),
    State(StateOp),
    /// Barrier: everything since the previous commit may be applied as a unit
    Commit,
}

impl Operation {
    pub fn data(stream: impl Into<String>, id: impl Into<String>, entity: Value) -> Self {
        Operation::Data(DataOp::new(stream, id, entity))
    }

    pub fn state(stream: impl Into<String>, cursor: Value) -> Self {
        Operation::State(StateOp::for_stream(stream, cursor))
    }

    pub fn commit() -> Self {
        Operation::Commit
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Operation::Commit)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Operation::Data(_) => "data",
            Operation::State(_) => "state",
            Operation::Commit => "commit",
        }
    }
}

impl From<DataOp> for Operation {
    fn from(op: DataOp) -> Self {
        Operation::Data(op)
    }
}

impl From<StateOp> for Operation {
    fn from(op: StateOp) -> Self {
        Operation::State(op)
    }
}

/// Full per-stream cursor mapping for one connector instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(BTreeMap<String, Value>);

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor recorded for `stream`, if any
    pub fn cursor(&self, stream: &str) -> Option<&Value> {
        self.0.get(stream)
    }

    /// Replace the cursor of every stream named in `state`.
    ///
    /// Streams absent from `state` keep their cursor; cursors of named streams
    /// are overwritten wholesale, never merged field by field.
    pub fn apply(&mut self, state: &StateOp) {
        for (stream, cursor) in &state.payload {
            self.0.insert(stream.clone(), cursor.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Checkpoint {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Checkpoint {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Tenant on whose behalf a connector instance operates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndUser {
    pub id: String,
}

impl EndUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}
