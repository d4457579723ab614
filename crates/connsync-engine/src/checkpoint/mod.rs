//! Durable per-instance checkpoints
//!
//! The runner reads a checkpoint once when a run starts and writes the whole
//! mapping back after every successful flush that changed it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use connsync_common::{Checkpoint, Result};

pub use memory::MemoryCheckpointStore;
pub use postgres::PgCheckpointStore;

/// Storage for connector-instance checkpoints
///
/// Failures of any method surface as `SyncError::CheckpointPersist`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last stored checkpoint, `None` before the first successful commit
    async fn get(&self, instance: &str) -> Result<Option<Checkpoint>>;

    /// Replace the stored mapping for `instance`
    async fn set(&self, instance: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// Remove the checkpoint on instance teardown. Returns whether one existed.
    async fn delete(&self, instance: &str) -> Result<bool>;
}
