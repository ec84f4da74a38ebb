//! PostgreSQL database adapter with connection pooling, catalog
//! introspection and restore loading.
//!
//! # Module Structure
//! - `connection`: URL parsing, pool setup and per-session settings
//! - `type_mapping`: PostgreSQL to unified data type conversion
//! - `schema_collection`: Table, column, key and index collection
//! - `rows`: Windowed row fetching and the restore loader
//!
//! # Security Guarantees
//! - Connection strings are sanitized in error messages and logs
//! - Backups can run every session with `default_transaction_read_only`

mod connection;
mod rows;
mod schema_collection;
mod type_mapping;

use super::{ConnectionConfig, DatabaseAdapter, RowWindow, TableLoader};
use crate::error::DbVaultError;
use crate::{Result, models::*};
use async_trait::async_trait;
use sqlx::PgPool;

pub use connection::DEFAULT_SCHEMA;
pub use rows::PostgresLoader;
pub use type_mapping::map_postgresql_type;

/// PostgreSQL database adapter scoped to one schema
pub struct PostgresAdapter {
    pub pool: PgPool,
    pub config: ConnectionConfig,
}

impl std::fmt::Debug for PostgresAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAdapter")
            .field("config", &self.config)
            .field("pool_size", &self.pool.size())
            .field("pool_idle", &self.pool.num_idle())
            .finish()
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn test_connection(&self) -> Result<()> {
        let version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&self.pool)
            .await
            .map_err(DbVaultError::connection_failed)?;
        tracing::debug!("PostgreSQL server version {}", version);
        Ok(())
    }

    async fn introspect(&self) -> Result<SchemaSnapshot> {
        schema_collection::introspect(self).await
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn connection_config(&self) -> ConnectionConfig {
        self.config.clone()
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        schema_collection::list_tables(self).await
    }

    async fn count_rows(&self, table: &TableMetadata) -> Result<u64> {
        rows::count_rows(self, table).await
    }

    async fn fetch_rows(&self, table: &TableMetadata, window: RowWindow) -> Result<Vec<Row>> {
        rows::fetch_rows(self, table, window).await
    }

    async fn execute_ddl(&self, statements: &[String]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DbVaultError::connection_failed)?;

        // Unqualified DDL lands in the adapter's schema
        let search_path = format!(
            "SET LOCAL search_path TO {}",
            self.dialect().quote_ident(self.schema())
        );
        sqlx::query(&search_path)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbVaultError::query_failed("Failed to select schema", e))?;

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
        let loader = PostgresLoader::begin(self, table).await?;
        Ok(Box::new(loader))
    }
}
