//! Bulk loading of mapped records
//!
//! Two strategies replace a register's table:
//!
//! - **In place**: drop secondary indexes, truncate, insert in batches, rebuild indexes.
//!   Readers can see an empty or partially loaded table while this runs, and a failure
//!   after the truncate leaves it that way.
//! - **Shadow swap**: load into `<table>_shadow`, index it, then rename it over the live
//!   table in one transaction. A failure drops the shadow and leaves the live table alone.
//!
//! A load is split into [`BulkLoader::prepare`], any number of [`BulkLoader::insert`] calls
//! and [`BulkLoader::finish`] (or [`BulkLoader::abort`]), so several source files can feed
//! one table. [`BulkLoader::load`] does all of it for an in-memory record set.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::TableDescriptor;
use crate::error::{IngestError, Result};
use crate::models::NormalizedRecord;

/// Bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Operations the loader needs from the database
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Drop the table's secondary indexes, if present
    async fn drop_indexes(&self, table: &TableDescriptor) -> Result<()>;

    async fn truncate(&self, table_name: &str) -> Result<()>;

    /// Insert one batch into `table_name`, which has the columns of `table`
    async fn insert_batch(
        &self,
        table_name: &str,
        table: &TableDescriptor,
        records: &[NormalizedRecord],
    ) -> Result<u64>;

    /// Build the table's secondary indexes on `table_name`, with `suffix` appended to each
    /// index name
    async fn create_indexes(&self, table_name: &str, table: &TableDescriptor, suffix: &str) -> Result<()>;

    /// Create an empty shadow table shaped like the live one, replacing any leftover
    async fn create_shadow(&self, table: &TableDescriptor) -> Result<()>;

    /// Atomically replace the live table (and its indexes) with the shadow
    async fn swap_shadow(&self, table: &TableDescriptor) -> Result<()>;

    async fn drop_shadow(&self, table: &TableDescriptor) -> Result<()>;
}

/// How a table is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    #[default]
    InPlace,
    ShadowSwap,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::InPlace => "in_place",
            LoadStrategy::ShadowSwap => "shadow_swap",
        }
    }
}

impl FromStr for LoadStrategy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "in_place" | "inplace" => Ok(LoadStrategy::InPlace),
            "shadow_swap" | "shadow" => Ok(LoadStrategy::ShadowSwap),
            other => Err(IngestError::Config(format!("unknown load strategy '{}'", other))),
        }
    }
}

impl std::fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A load in progress: which table rows are inserted into
#[derive(Debug, Clone)]
pub struct LoadTarget {
    pub table: &'static TableDescriptor,
    pub insert_into: String,
    pub strategy: LoadStrategy,
}

/// Replaces a table's contents in batches
#[derive(Clone)]
pub struct BulkLoader {
    store: Arc<dyn TableStore>,
    batch_size: usize,
    strategy: LoadStrategy,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn TableStore>, batch_size: usize, strategy: LoadStrategy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            strategy,
        }
    }

    pub fn strategy(&self) -> LoadStrategy {
        self.strategy
    }

    /// Rows per INSERT for `table`, capped so one statement stays under the bind limit
    pub fn rows_per_batch(&self, table: &TableDescriptor) -> usize {
        let cap = MAX_BIND_PARAMS / table.columns.len().max(1);
        self.batch_size.min(cap).max(1)
    }

    /// Clear the way for new rows
    pub async fn prepare(&self, table: &'static TableDescriptor) -> Result<LoadTarget> {
        match self.strategy {
            LoadStrategy::InPlace => {
                debug!(table = table.name, "Dropping indexes");
                self.store.drop_indexes(table).await?;
                debug!(table = table.name, "Truncating");
                self.store.truncate(table.name).await?;
                Ok(LoadTarget {
                    table,
                    insert_into: table.name.to_string(),
                    strategy: self.strategy,
                })
            }
            LoadStrategy::ShadowSwap => {
                let shadow = table.shadow_name();
                debug!(table = table.name, shadow = %shadow, "Creating shadow table");
                self.store.create_shadow(table).await?;
                Ok(LoadTarget {
                    table,
                    insert_into: shadow,
                    strategy: self.strategy,
                })
            }
        }
    }

    /// Insert records in batches; returns rows written
    pub async fn insert(&self, target: &LoadTarget, records: &[NormalizedRecord]) -> Result<u64> {
        if let Some(stray) = records.iter().find(|r| r.register().table().name != target.table.name) {
            return Err(IngestError::PersistenceFailed(format!(
                "{} record {} cannot be loaded into {}",
                stray.register(),
                stray.external_code(),
                target.table.name
            )));
        }

        let mut written = 0;
        for batch in records.chunks(self.rows_per_batch(target.table)) {
            written += self
                .store
                .insert_batch(&target.insert_into, target.table, batch)
                .await?;
        }
        Ok(written)
    }

    /// Rebuild indexes and, for a shadow load, swap it in
    pub async fn finish(&self, target: &LoadTarget) -> Result<()> {
        match target.strategy {
            LoadStrategy::InPlace => {
                debug!(table = target.table.name, "Rebuilding indexes");
                self.store.create_indexes(target.table.name, target.table, "").await
            }
            LoadStrategy::ShadowSwap => {
                debug!(table = target.table.name, "Indexing shadow table");
                self.store
                    .create_indexes(&target.insert_into, target.table, "_shadow")
                    .await?;
                self.store.swap_shadow(target.table).await?;
                info!(table = target.table.name, "Shadow table swapped in");
                Ok(())
            }
        }
    }

    /// Best-effort cleanup after a failed load
    pub async fn abort(&self, target: &LoadTarget) {
        let outcome = match target.strategy {
            LoadStrategy::InPlace => {
                warn!(
                    table = target.table.name,
                    "Load failed after truncate; table may be empty or partially loaded"
                );
                self.store.create_indexes(target.table.name, target.table, "").await
            }
            LoadStrategy::ShadowSwap => {
                warn!(table = target.table.name, "Load failed; dropping shadow, live table untouched");
                self.store.drop_shadow(target.table).await
            }
        };
        if let Err(e) = outcome {
            warn!(table = target.table.name, error = %e, "Cleanup after failed load also failed");
        }
    }

    /// Replace the table's contents with `records`
    pub async fn load(&self, records: &[NormalizedRecord], table: &'static TableDescriptor) -> Result<u64> {
        let target = self.prepare(table).await?;

        let result: Result<u64> = async {
            let count = self.insert(&target, records).await?;
            self.finish(&target).await?;
            Ok::<_, IngestError>(count)
        }
        .await;

        if result.is_err() {
            self.abort(&target).await;
        }
        result
    }
}
