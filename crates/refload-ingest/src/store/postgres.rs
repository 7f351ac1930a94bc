//! PostgreSQL table store

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::catalog::TableDescriptor;
use crate::error::{IngestError, Result};
use crate::loader::TableStore;
use crate::models::NormalizedRecord;

/// Suffix the live table is renamed to while a shadow takes its place
const RETIRED_SUFFIX: &str = "_retired";

/// [`TableStore`] over a PostgreSQL pool
///
/// Table and index names are interpolated into DDL; they only ever come from the static
/// catalog descriptors.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        info!("Database connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| IngestError::PersistenceFailed(format!("migrations: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        debug!(sql, "Executing");
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for PgStore {
    async fn drop_indexes(&self, table: &TableDescriptor) -> Result<()> {
        for index in table.indexes {
            self.execute(&format!("DROP INDEX IF EXISTS {}", index.name)).await?;
        }
        Ok(())
    }

    async fn truncate(&self, table_name: &str) -> Result<()> {
        self.execute(&format!("TRUNCATE TABLE {}", table_name)).await
    }

    async fn insert_batch(
        &self,
        table_name: &str,
        table: &TableDescriptor,
        records: &[NormalizedRecord],
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            table_name,
            table.columns.join(", ")
        ));

        query_builder.push_values(records, |mut b, record| match record {
            NormalizedRecord::Address(entry) => {
                b.push_bind(entry.code)
                    .push_bind(entry.type_code)
                    .push_bind(entry.level.code())
                    .push_bind(&entry.status)
                    .push_bind(entry.parent_code)
                    .push_bind(entry.parent_type_code)
                    .push_bind(&entry.name)
                    .push_bind(&entry.sort_name)
                    .push_bind(&entry.postal_code)
                    .push_bind(entry.valid_from)
                    .push_bind(entry.valid_to)
                    .push_bind(entry.updated_on)
                    .push_bind(&entry.full_name)
                    .push_bind(&entry.region_code);
            }
            NormalizedRecord::Company(entry) => {
                b.push_bind(entry.reg_code)
                    .push_bind(&entry.type_code)
                    .push_bind(&entry.type_name)
                    .push_bind(&entry.status)
                    .push_bind(entry.address_code)
                    .push_bind(&entry.name)
                    .push_bind(&entry.display_name)
                    .push_bind(&entry.sort_name)
                    .push_bind(&entry.address)
                    .push_bind(&entry.postal_code)
                    .push_bind(entry.registered_on)
                    .push_bind(entry.terminated_on)
                    .push_bind(entry.updated_on)
                    .push_bind(&entry.region_code);
            }
        });

        let result = query_builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn create_indexes(&self, table_name: &str, table: &TableDescriptor, suffix: &str) -> Result<()> {
        for index in table.indexes {
            self.execute(&format!(
                "CREATE INDEX IF NOT EXISTS {}{} ON {} ({})",
                index.name, suffix, table_name, index.column
            ))
            .await?;
        }
        Ok(())
    }

    async fn create_shadow(&self, table: &TableDescriptor) -> Result<()> {
        let shadow = table.shadow_name();
        self.execute(&format!("DROP TABLE IF EXISTS {}", shadow)).await?;
        self.execute(&format!(
            "CREATE TABLE {} (LIKE {} INCLUDING DEFAULTS INCLUDING CONSTRAINTS)",
            shadow, table.name
        ))
        .await
    }

    async fn swap_shadow(&self, table: &TableDescriptor) -> Result<()> {
        let shadow = table.shadow_name();
        let retired = format!("{}{}", table.name, RETIRED_SUFFIX);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", table.name, retired))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", shadow, table.name))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DROP TABLE {}", retired))
            .execute(&mut *tx)
            .await?;
        for index in table.indexes {
            sqlx::query(&format!("ALTER INDEX {}_shadow RENAME TO {}", index.name, index.name))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn drop_shadow(&self, table: &TableDescriptor) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", table.shadow_name()))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::RegisterKind;
    use crate::loader::{BulkLoader, LoadStrategy};
    use crate::models::{AddressEntry, AddressLevel};
    use chrono::NaiveDate;
    use std::sync::Arc;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/refload".to_string());
        let store = PgStore::connect(&url, 2).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn record(code: i64) -> NormalizedRecord {
        NormalizedRecord::Address(AddressEntry {
            code,
            type_code: 108,
            level: AddressLevel::Building,
            status: "EKS".to_string(),
            parent_code: 100000001,
            parent_type_code: 107,
            name: "1".to_string(),
            sort_name: "0001".to_string(),
            postal_code: Some("LV-1010".to_string()),
            valid_from: NaiveDate::from_ymd_opt(2010, 1, 1),
            valid_to: None,
            updated_on: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            full_name: "Brīvības iela 1, Rīga".to_string(),
            region_code: None,
        })
    }

    async fn count(store: &PgStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM address_entries")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_in_place_load_round_trip() {
        let store = store().await;
        let loader = BulkLoader::new(Arc::new(store.clone()), 2, LoadStrategy::InPlace);
        let records: Vec<_> = (1..=5).map(record).collect();

        let loaded = loader.load(&records, RegisterKind::Address.table()).await.unwrap();
        assert_eq!(loaded, 5);
        assert_eq!(count(&store).await, 5);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_shadow_swap_keeps_index_names() {
        let store = store().await;
        let loader = BulkLoader::new(Arc::new(store.clone()), 100, LoadStrategy::ShadowSwap);

        loader.load(&[record(7)], RegisterKind::Address.table()).await.unwrap();
        assert_eq!(count(&store).await, 1);

        let indexes: Vec<String> = sqlx::query_scalar(
            "SELECT indexname::text FROM pg_indexes WHERE tablename = 'address_entries' ORDER BY 1",
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(
            indexes,
            vec![
                "idx_address_entries_code",
                "idx_address_entries_full_name",
                "idx_address_entries_parent_code",
            ]
        );
    }
}
