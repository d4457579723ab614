//! Destination side of the sync protocol
//!
//! A [`Destination`] receives data operations one at a time and applies them
//! durably on [`Destination::flush`]. [`BatchDestination`] is the standard
//! implementation: a [`BatchAccumulator`] in front of an [`UpsertWriter`].

pub mod accumulator;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use connsync_common::{DataOp, Result};
use tracing::debug;

pub use accumulator::{
    BatchAccumulator, CollectionBatch, DestinationContext, PendingBatches, UpsertRow,
};
pub use memory::{MemoryWriter, StoredRow};
pub use postgres::PgUpsertWriter;

/// A connector capable of consuming records
#[async_trait]
pub trait Destination: Send {
    fn name(&self) -> &str;

    /// Stage one record; nothing is written until the next flush
    fn ingest(&mut self, op: DataOp) -> Result<()>;

    /// Apply everything staged since the last successful flush as one unit.
    ///
    /// Returns the number of rows written. On error nothing staged is lost,
    /// so calling `flush` again retries the same content.
    async fn flush(&mut self) -> Result<usize>;

    /// Rows staged and not yet flushed
    fn pending(&self) -> usize;
}

/// Storage backend applying pending batches with upsert semantics
#[async_trait]
pub trait UpsertWriter: Send + Sync {
    /// Write every non-empty batch in `batches`.
    ///
    /// Implementations must:
    /// 1. Upsert each row on `(source_id, id)`, fully replacing an existing row
    /// 2. Apply all collections atomically: either every row lands or none does
    /// 3. Create a collection's storage on first use if it does not exist
    async fn write(&self, batches: &PendingBatches) -> Result<()>;
}

/// Destination that batches per collection and writes on flush
pub struct BatchDestination<W> {
    name: String,
    accumulator: BatchAccumulator,
    writer: W,
}

impl<W: UpsertWriter> BatchDestination<W> {
    pub fn new(name: impl Into<String>, ctx: DestinationContext, writer: W) -> Self {
        Self {
            name: name.into(),
            accumulator: BatchAccumulator::new(ctx),
            writer,
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.accumulator
    }
}

#[async_trait]
impl<W: UpsertWriter> Destination for BatchDestination<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn ingest(&mut self, op: DataOp) -> Result<()> {
        self.accumulator.ingest(op)
    }

    async fn flush(&mut self) -> Result<usize> {
        let size = self.accumulator.pending();
        if size == 0 {
            return Ok(0);
        }

        debug!(
            destination = %self.name,
            size,
            collections = self.accumulator.batches().len(),
            "Flushing pending batches"
        );

        self.writer.write(self.accumulator.batches()).await?;
        self.accumulator.clear();

        debug!(destination = %self.name, size, "Flushed pending batches");
        Ok(size)
    }

    fn pending(&self) -> usize {
        self.accumulator.pending()
    }
}
