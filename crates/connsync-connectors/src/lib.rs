//! connsync connectors
//!
//! Concrete connectors for the sync engine and the registry that builds them
//! from pipeline configuration.
//!
//! # Connectors
//!
//! - **rest_cursor**: any cursor-paginated REST API (`{results, next}` pages)
//! - **postgres**: entity tables and templated queries as a source, upserted
//!   tables as a destination
//!
//! # Example
//!
//! ```no_run
//! use connsync_connectors::registry::ConnectorRegistry;
//! use connsync_engine::{checkpoint::PgCheckpointStore, db, ledger::PgRunLedger, Config, Scheduler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::run_migrations(&pool).await?;
//!
//!     let scheduler = Scheduler::new(
//!         &config,
//!         Arc::new(ConnectorRegistry::new(pool.clone(), config.destination.clone())),
//!         Arc::new(PgCheckpointStore::new(pool.clone())),
//!         Arc::new(PgRunLedger::new(pool)),
//!     );
//!     scheduler.run_forever().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod postgres;
pub mod registry;
pub mod rest_cursor;

pub use registry::ConnectorRegistry;
