//! connsync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared protocol types, the error taxonomy and logging setup used by every
//! connsync workspace member.
//!
//! - **Types**: [`Operation`], [`DataOp`], [`StateOp`], [`Checkpoint`]
//! - **Errors**: [`SyncError`] and the [`ErrorKind`] tags reported per run
//! - **Logging**: `tracing` subscriber configuration
//!
//! # Example
//!
//! ```
//! use connsync_common::{Checkpoint, Operation};
//! use serde_json::json;
//!
//! let ops = vec![
//!     Operation::data("account", "1", json!({"name": "Acme"})),
//!     Operation::state("account", json!({"cursor": "1"})),
//!     Operation::commit(),
//! ];
//!
//! let mut checkpoint = Checkpoint::new();
//! for op in &ops {
//!     if let Operation::State(state) = op {
//!         checkpoint.apply(state);
//!     }
//! }
//! assert_eq!(checkpoint.cursor("account"), Some(&json!({"cursor": "1"})));
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorKind, Result, SyncError};
pub use types::{Checkpoint, DataOp, EndUser, Operation, StateOp};
