//! In-process checkpoint store

use async_trait::async_trait;
use connsync_common::{Checkpoint, Result, SyncError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::CheckpointStore;

#[derive(Debug, Default)]
struct State {
    checkpoints: HashMap<String, Checkpoint>,
    history: HashMap<String, Vec<Checkpoint>>,
    fail_next_sets: usize,
}

/// Checkpoint store kept in memory.
///
/// Every successful `set` is also appended to a per-instance history so tests
/// can assert how the checkpoint advanced.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<State>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a checkpoint for `instance`
    pub fn with_checkpoint(instance: impl Into<String>, checkpoint: Checkpoint) -> Self {
        let store = Self::new();
        store.lock().checkpoints.insert(instance.into(), checkpoint);
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` calls to `set` fail
    pub fn fail_next_sets(&self, n: usize) {
        self.lock().fail_next_sets = n;
    }

    /// Checkpoints written for `instance`, oldest first
    pub fn history(&self, instance: &str) -> Vec<Checkpoint> {
        self.lock().history.get(instance).cloned().unwrap_or_default()
    }

    /// Current checkpoint without going through the async trait
    pub fn snapshot(&self, instance: &str) -> Option<Checkpoint> {
        self.lock().checkpoints.get(instance).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, instance: &str) -> Result<Option<Checkpoint>> {
        Ok(self.snapshot(instance))
    }

    async fn set(&self, instance: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.lock();
        if state.fail_next_sets > 0 {
            state.fail_next_sets -= 1;
            return Err(SyncError::checkpoint("injected checkpoint failure"));
        }

        state
            .checkpoints
            .insert(instance.to_string(), checkpoint.clone());
        state
            .history
            .entry(instance.to_string())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, instance: &str) -> Result<bool> {
        let mut state = self.lock();
        state.history.remove(instance);
        Ok(state.checkpoints.remove(instance).is_some())
    }
}
