//! Error types for connsync
//!
//! Every failure that crosses a component boundary is a [`SyncError`]. The
//! pipeline runner reduces it to an [`ErrorKind`] tag so the scheduler sees one
//! terminal status per run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for the sync protocol
#[derive(Error, Debug)]
pub enum SyncError {
    /// Rate limit, network failure or upstream 5xx while fetching a page.
    #[error("Transient source error: {0}")]
    TransientSource(String),

    /// A single record could not be turned into an operation.
    #[error("Malformed record in stream '{stream}': {reason}")]
    MalformedRecord { stream: String, reason: String },

    /// Constraint violation or connection loss during a flush.
    #[error("Destination write error: {0}")]
    DestinationWrite(String),

    /// The flush succeeded but the checkpoint could not be stored.
    #[error("Checkpoint persist error: {0}")]
    CheckpointPersist(String),

    /// Bad credentials, schema mismatch or invalid connector settings.
    #[error("Configuration error: {0}")]
    FatalConfiguration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn transient(msg: impl Into<String>) -> Self {
        SyncError::TransientSource(msg.into())
    }

    pub fn malformed(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::MalformedRecord {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    pub fn destination(msg: impl Into<String>) -> Self {
        SyncError::DestinationWrite(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        SyncError::CheckpointPersist(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::FatalConfiguration(msg.into())
    }

    /// Taxonomy tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientSource(_) => ErrorKind::TransientSource,
            SyncError::MalformedRecord { .. } => ErrorKind::MalformedRecord,
            SyncError::DestinationWrite(_) => ErrorKind::DestinationWrite,
            SyncError::CheckpointPersist(_) => ErrorKind::CheckpointPersist,
            SyncError::FatalConfiguration(_) | SyncError::Serialization(_) => {
                ErrorKind::FatalConfiguration
            },
        }
    }
}

/// Terminal status tag reported for a failed or interrupted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientSource,
    MalformedRecord,
    DestinationWrite,
    CheckpointPersist,
    FatalConfiguration,
    /// The run was stopped cooperatively between commit cycles.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientSource => "transient_source",
            ErrorKind::MalformedRecord => "malformed_record",
            ErrorKind::DestinationWrite => "destination_write",
            ErrorKind::CheckpointPersist => "checkpoint_persist",
            ErrorKind::FatalConfiguration => "fatal_configuration",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether the scheduler may retry the run from the last checkpoint
    /// without outside intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientSource
                | ErrorKind::DestinationWrite
                | ErrorKind::CheckpointPersist
                | ErrorKind::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
