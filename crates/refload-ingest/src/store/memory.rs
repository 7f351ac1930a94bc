//! In-process table store
//!
//! Mirrors the table/index bookkeeping of the PostgreSQL store closely enough for the
//! loader's sequencing to be observable, and records every operation in order.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::catalog::TableDescriptor;
use crate::error::{IngestError, Result};
use crate::loader::TableStore;
use crate::models::NormalizedRecord;

/// Operation a [`MemoryStore`] can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Insert,
    CreateIndexes,
    Swap,
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<NormalizedRecord>,
    indexes: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Table>,
    operations: Vec<String>,
}

/// [`TableStore`](crate::loader::TableStore) keeping tables in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failure: Option<FailPoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call of the given operation with `PersistenceFailed`
    pub fn with_failure(mut self, failure: FailPoint) -> Self {
        self.failure = Some(failure);
        self
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if self.failure == Some(point) {
            return Err(IngestError::PersistenceFailed(format!("injected {:?} failure", point)));
        }
        Ok(())
    }

    /// Replace a table's rows without going through the loader
    pub async fn seed(&self, table_name: &str, rows: Vec<NormalizedRecord>) {
        let mut inner = self.inner.lock().await;
        inner.tables.entry(table_name.to_string()).or_default().rows = rows;
    }

    pub async fn rows(&self, table_name: &str) -> Vec<NormalizedRecord> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table_name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table_name: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.tables.get(table_name).map_or(0, |t| t.rows.len())
    }

    pub async fn indexes(&self, table_name: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table_name)
            .map(|t| t.indexes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_table(&self, table_name: &str) -> bool {
        self.inner.lock().await.tables.contains_key(table_name)
    }

    /// Operations performed so far, as `"<op> <table>"`
    pub async fn operations(&self) -> Vec<String> {
        self.inner.lock().await.operations.clone()
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn drop_indexes(&self, table: &TableDescriptor) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.operations.push(format!("drop_indexes {}", table.name));
        if let Some(t) = inner.tables.get_mut(table.name) {
            for index in table.indexes {
                t.indexes.remove(index.name);
            }
        }
        Ok(())
    }

    async fn truncate(&self, table_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.operations.push(format!("truncate {}", table_name));
        inner.tables.entry(table_name.to_string()).or_default().rows.clear();
        Ok(())
    }

    async fn insert_batch(
        &self,
        table_name: &str,
        _table: &TableDescriptor,
        records: &[NormalizedRecord],
    ) -> Result<u64> {
        self.check(FailPoint::Insert)?;
        let mut inner = self.inner.lock().await;
        inner.operations.push(format!("insert {}", table_name));
        let t = inner.tables.get_mut(table_name).ok_or_else(|| {
            IngestError::PersistenceFailed(format!("relation \"{}\" does not exist", table_name))
        })?;
        t.rows.extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn create_indexes(&self, table_name: &str, table: &TableDescriptor, suffix: &str) -> Result<()> {
        self.check(FailPoint::CreateIndexes)?;
        let mut inner = self.inner.lock().await;
        inner.operations.push(format!("create_indexes {}", table_name));
        let t = inner.tables.entry(table_name.to_string()).or_default();
        for index in table.indexes {
            t.indexes.insert(format!("{}{}", index.name, suffix));
        }
        Ok(())
    }

    async fn create_shadow(&self, table: &TableDescriptor) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.operations.push(format!("create_shadow {}", table.name));
        inner.tables.insert(table.shadow_name(), Table::default());
        Ok(())
    }

    async fn swap_shadow(&self, table: &TableDescriptor) -> Result<()> {
        self.check(FailPoint::Swap)?;
        let mut inner = self.inner.lock().await;
        inner.operations.push(format!("swap_shadow {}", table.name));
        let mut shadow = inner.tables.remove(&table.shadow_name()).ok_or_else(|| {
            IngestError::PersistenceFailed(format!("no shadow table for {}", table.name))
        })?;
        shadow.indexes = shadow
            .indexes
            .iter()
            .map(|name| name.strip_suffix("_shadow").unwrap_or(name.as_str()).to_string())
            .collect();
        inner.tables.insert(table.name.to_string(), shadow);
        Ok(())
    }

    async fn drop_shadow(&self, table: &TableDescriptor) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.operations.push(format!("drop_shadow {}", table.name));
        inner.tables.remove(&table.shadow_name());
        Ok(())
    }
}
