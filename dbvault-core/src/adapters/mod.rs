//! The engine boundary: everything backup and restore need from a database.
//!
//! Every supported engine implements [`DatabaseAdapter`]: read-only
//! introspection and row fetching for backups, plus the small write surface
//! a restore needs (DDL execution and per-table load transactions through
//! [`TableLoader`]).
//!
//! Engines are compiled in through the `postgresql` and `sqlite` features.

use crate::{
    Result,
    ddl::Dialect,
    models::{CellValue, DatabaseType, Row, SchemaSnapshot, TableMetadata},
};
use async_trait::async_trait;

pub mod config;

#[cfg(any(feature = "postgresql", feature = "sqlite"))]
pub mod helpers;

#[cfg(feature = "postgresql")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use config::{AccessMode, ConnectionConfig};

/// Slice of a table's rows in a stable order.
///
/// Rows are ordered by primary key (physical order without one). A window
/// either skips `offset` rows or, for keyset paging, starts after the
/// primary key in `after`, so that a chunked scan stays linear.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWindow {
    pub offset: u64,
    /// `None` fetches everything from the start of the window on
    pub limit: Option<u64>,
    /// Primary-key values of the last row already read, in key order
    pub after: Option<Vec<CellValue>>,
}

impl RowWindow {
    /// The whole table in one fetch
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: None,
            after: None,
        }
    }

    /// A bounded chunk
    pub fn chunk(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
            after: None,
        }
    }

    /// The next `limit` rows whose primary key sorts after `key`
    pub fn after_key(key: Vec<CellValue>, limit: u64) -> Self {
        Self {
            offset: 0,
            limit: Some(limit),
            after: Some(key),
        }
    }

    /// Window following `last`, the final row of a chunk that ended after
    /// `read` rows of `table`.
    ///
    /// Pages by key when the table has a primary key and `last` holds no
    /// NULL key cell (SQLite admits those); by offset otherwise.
    pub fn following(table: &TableMetadata, last: &[CellValue], read: u64, limit: u64) -> Self {
        let key: Option<Vec<CellValue>> = if table.primary_key.is_empty() {
            None
        } else {
            table
                .primary_key
                .iter()
                .map(|name| {
                    table
                        .columns
                        .iter()
                        .position(|column| &column.name == name)
                        .and_then(|index| last.get(index))
                        .filter(|cell| **cell != CellValue::Null)
                        .cloned()
                })
                .collect()
        };
        match key {
            Some(key) => Self::after_key(key, limit),
            None => Self::chunk(read, limit),
        }
    }

    pub fn is_keyset(&self) -> bool {
        self.after.is_some()
    }
}

/// One connected database.
///
/// Used as `&dyn DatabaseAdapter` throughout the engine. Introspection and
/// row fetching never write; only [`DatabaseAdapter::execute_ddl`] and the
/// loaders returned by [`DatabaseAdapter::begin_load`] do. Credentials stay
/// inside the pool and never appear in errors or logs.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Tests the database connection without reading any schema.
    ///
    /// # Errors
    /// Returns `Connection` if the database is unreachable.
    async fn test_connection(&self) -> Result<()>;

    /// Reads tables, columns, keys and indexes from the system catalogs.
    ///
    /// All-or-nothing: any failed metadata query aborts the pass and no
    /// partial snapshot is returned.
    ///
    /// # Errors
    /// Returns `Introspection` if any metadata query fails.
    async fn introspect(&self) -> Result<SchemaSnapshot>;

    fn database_type(&self) -> DatabaseType;

    /// Settings the pool was opened with
    fn connection_config(&self) -> ConnectionConfig;

    /// SQL dialect used for DDL against this engine
    fn dialect(&self) -> Dialect {
        Dialect::for_database(self.database_type())
    }

    /// Names of the user tables currently present, sorted.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Exact row count of a table.
    async fn count_rows(&self, table: &TableMetadata) -> Result<u64>;

    /// Fetches a window of rows, cells in column ordinal order.
    ///
    /// Rows are ordered by primary key (or the engine's physical row id when
    /// there is none) so that consecutive windows never overlap.
    ///
    /// # Errors
    /// Returns `ChunkIo` for transient failures and `QueryExecution` for
    /// anything that will not go away on retry.
    async fn fetch_rows(&self, table: &TableMetadata, window: RowWindow) -> Result<Vec<Row>>;

    /// Executes DDL statements in a single transaction.
    async fn execute_ddl(&self, statements: &[String]) -> Result<()>;

    /// Opens a write transaction scoped to one table.
    async fn begin_load(&self, table: &TableMetadata) -> Result<Box<dyn TableLoader>>;
}

/// Write transaction for a single table during restore.
///
/// Dropping a loader without calling [`TableLoader::commit`] rolls the
/// transaction back.
#[async_trait]
pub trait TableLoader: Send {
    /// Inserts rows; each row carries one cell per entry in `columns`.
    async fn insert_rows(&mut self, columns: &[String], rows: &[Row]) -> Result<()>;

    /// Updates `set_columns` of the rows identified by `key_columns`.
    ///
    /// Each row carries the key values first, then the new values.
    async fn update_rows(
        &mut self,
        key_columns: &[String],
        set_columns: &[String],
        rows: &[Row],
    ) -> Result<()>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens an adapter for `connection_string` with restore-side settings.
///
/// # Errors
/// See [`create_adapter_with_config`].
pub async fn create_adapter(connection_string: &str) -> Result<Box<dyn DatabaseAdapter>> {
    create_adapter_with_config(connection_string, ConnectionConfig::for_restore()).await
}

/// Opens an adapter for the engine named by the connection string.
///
/// # Errors
/// - `Configuration` when `config` is invalid or the engine is not recognized
/// - `UnsupportedFeature` when the engine's cargo feature is disabled
/// - `Connection` when the database cannot be reached
pub async fn create_adapter_with_config(
    connection_string: &str,
    config: ConnectionConfig,
) -> Result<Box<dyn DatabaseAdapter>> {
    config.validate()?;
    let engine = detect_database_type(connection_string)?;
    tracing::debug!("Opening {} adapter with {:?} access", engine, config.access);

    match engine {
        #[cfg(feature = "postgresql")]
        DatabaseType::PostgreSQL => Ok(Box::new(
            postgres::PostgresAdapter::with_config(connection_string, config).await?,
        )),
        #[cfg(feature = "sqlite")]
        DatabaseType::SQLite => Ok(Box::new(
            sqlite::SqliteAdapter::with_config(connection_string, config).await?,
        )),
        #[allow(unreachable_patterns)]
        other => Err(crate::error::DbVaultError::unsupported_feature(
            "this build",
            format!("{} (enable the matching cargo feature)", other),
        )),
    }
}

/// Names the engine behind a connection string without connecting.
///
/// URLs are recognized by scheme; bare `.db`, `.sqlite` and `.sqlite3`
/// paths and `:memory:` are SQLite.
///
/// # Errors
/// Returns `Configuration` for anything else.
pub fn detect_database_type(connection_string: &str) -> Result<DatabaseType> {
    let scheme = connection_string
        .split_once(':')
        .map(|(scheme, _)| scheme.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("postgres" | "postgresql") => return Ok(DatabaseType::PostgreSQL),
        Some("sqlite") => return Ok(DatabaseType::SQLite),
        _ => {}
    }
    let is_sqlite_file = [".db", ".sqlite", ".sqlite3"]
        .iter()
        .any(|ext| connection_string.ends_with(ext));
    if connection_string == ":memory:" || is_sqlite_file {
        return Ok(DatabaseType::SQLite);
    }
    Err(crate::error::DbVaultError::configuration(format!(
        "cannot tell the database engine from '{}'",
        crate::error::redact_database_url(connection_string)
    )))
}
