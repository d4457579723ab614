//! connsync engine
//!
//! Runtime side of the connector sync protocol.
//!
//! # Overview
//!
//! - **Sources** ([`source`]): lazy page streams resumed from a checkpoint
//! - **Destinations** ([`destination`]): per-collection batching with
//!   transactional, idempotent upserts
//! - **Checkpoints** ([`checkpoint`]): per-instance resume state
//! - **Runner** ([`runner`]): drives one source into one destination and
//!   advances the checkpoint only after a durable flush
//! - **Scheduler** ([`scheduler`]): runs due pipelines with bounded concurrency
//!
//! # Example
//!
//! ```no_run
//! use connsync_engine::checkpoint::MemoryCheckpointStore;
//! use connsync_engine::destination::{BatchDestination, DestinationContext, MemoryWriter};
//! use connsync_engine::runner::{Runner, RunnerConfig, SyncInstance};
//! use connsync_engine::source::Source;
//!
//! async fn sync_once(source: &dyn Source) {
//!     let writer = MemoryWriter::new();
//!     let mut destination =
//!         BatchDestination::new("memory", DestinationContext::default(), writer.clone());
//!     let store = MemoryCheckpointStore::new();
//!
//!     let result = Runner::new(RunnerConfig::default())
//!         .run(&SyncInstance::new("conn_1", None), source, &mut destination, &store)
//!         .await;
//!     assert!(result.is_success());
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod db;
pub mod destination;
pub mod ledger;
pub mod runner;
pub mod scheduler;
pub mod source;

// Re-export commonly used types
pub use checkpoint::CheckpointStore;
pub use config::Config;
pub use connector::{Passthrough, PassthroughRequest, PassthroughResponse};
pub use destination::{BatchDestination, Destination, UpsertWriter};
pub use runner::{RunResult, Runner, RunnerConfig, SyncInstance};
pub use scheduler::{BuiltPipeline, PipelineFactory, Scheduler};
pub use source::{Page, PageStream, Source, SourceContext, SyncMode};
