//! SQLite database adapter with schema introspection, row streaming and
//! restore loading.
//!
//! # Module Structure
//! - `connection`: Connection string parsing and pool setup
//! - `type_mapping`: SQLite to unified data type conversion
//! - `schema_collection`: Table, column, key and index collection via PRAGMA
//! - `rows`: Windowed row fetching and the restore loader
//!
//! # SQLite-Specific Behavior
//! - Cells keep their storage class (`INTEGER`, `REAL`, `TEXT`, `BLOB`)
//! - Tables without a primary key are paged by `rowid`
//! - Foreign keys are checked at commit during a restore load

pub mod connection;
pub mod rows;
pub mod schema_collection;
pub mod type_mapping;

use super::{ConnectionConfig, DatabaseAdapter, RowWindow, TableLoader};
use crate::Result;
use crate::error::DbVaultError;
use crate::models::*;
use async_trait::async_trait;
use sqlx::SqlitePool;

pub use connection::SqliteTarget;
pub use type_mapping::map_sqlite_type;

/// SQLite database adapter.
pub struct SqliteAdapter {
    /// Connection pool (a single connection for in-memory databases)
    pub pool: SqlitePool,
    /// Connection configuration
    pub config: ConnectionConfig,
    in_memory: bool,
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("config", &self.config)
            .field("is_in_memory", &self.in_memory)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    async fn test_connection(&self) -> Result<()> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await
            .map_err(DbVaultError::connection_failed)?;
        tracing::debug!("SQLite library version {}", version);
        Ok(())
    }

    async fn introspect(&self) -> Result<SchemaSnapshot> {
        schema_collection::introspect(self).await
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn connection_config(&self) -> ConnectionConfig {
        self.config.clone()
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        schema_collection::list_tables(self).await
    }

    async fn count_rows(&self, table: &TableMetadata) -> Result<u64> {
        rows::count_rows(&self.pool, table).await
    }

    async fn fetch_rows(&self, table: &TableMetadata, window: RowWindow) -> Result<Vec<Row>> {
        rows::fetch_rows(&self.pool, table, window).await
    }

    async fn execute_ddl(&self, statements: &[String]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DbVaultError::connection_failed)?;
        for statement in statements {
            tracing::debug!("Executing DDL: {}", statement);
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| DbVaultError::query_failed("Failed to execute DDL", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| DbVaultError::query_failed("Failed to commit DDL", e))
    }

    async fn begin_load(&self, table: &TableMetadata) -> Result<Box<dyn TableLoader>> {
        let loader = rows::SqliteLoader::begin(&self.pool, &table.name).await?;
        Ok(Box::new(loader))
    }
}
