//! Refload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Refreshes reference registers (addresses, companies) from their published full
//! snapshots.
//!
//! # Pipeline
//!
//! - **Gate** ([`gate`]): skip snapshots identical to the last one loaded
//! - **Fetch** ([`fetcher`]): download and unpack into a per-run directory
//! - **Tokenize** ([`tokenizer`]): the registers' own CSV dialect, multi-line fields included
//! - **Map** ([`mapper`]): positional rows to typed records, per [`catalog`] layout
//! - **Stage** ([`spool`]): hold mapped records on disk until every file has parsed
//! - **Load** ([`loader`], [`store`]): replace the target table in batches
//!
//! [`orchestrator::ImportOrchestrator`] sequences these for one register at a time.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use refload_ingest::{ImportOrchestrator, IngestConfig, PgStore, RegisterKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
//!     let orchestrator = ImportOrchestrator::new(config, Arc::new(store)).await?;
//!
//!     let report = orchestrator.run_import(RegisterKind::Address).await;
//!     println!("{:?}: {} records", report.status, report.records_loaded);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod gate;
pub mod loader;
pub mod mapper;
pub mod models;
pub mod orchestrator;
pub mod spool;
pub mod store;
pub mod tokenizer;

pub use catalog::{RegisterKind, RowPolicy, SchemaCatalog, SchemaEntry};
pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use loader::{BulkLoader, LoadStrategy, TableStore};
pub use orchestrator::{CancelFlag, ImportOrchestrator, ImportReport, ImportStatus};
pub use store::{MemoryStore, PgStore};
