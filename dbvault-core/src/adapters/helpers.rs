//! Helper utilities shared by the adapter implementations.

use crate::{Result, error::DbVaultError};

/// Extension trait for extracting typed values from database rows
/// with consistent error handling.
///
/// # Example
/// ```rust,ignore
/// use dbvault_core::adapters::helpers::RowExt;
///
/// let name: String = row.get_field("column_name", Some("my_table"))?;
/// let default: Option<String> = row.get_field("dflt_value", None)?;
/// ```
pub trait RowExt: sqlx::Row {
    /// Extracts a typed field from the row with proper error context.
    fn get_field<'r, T>(&'r self, field_name: &str, table_context: Option<&str>) -> Result<T>
    where
        T: sqlx::Decode<'r, Self::Database> + sqlx::Type<Self::Database>,
        for<'s> &'s str: sqlx::ColumnIndex<Self>,
    {
        self.try_get(field_name)
            .map_err(|e| DbVaultError::decode_field(field_name, table_context, e))
    }
}

impl<R: sqlx::Row> RowExt for R {}

/// Maps a row-fetch failure to `ChunkIo` (retried) or `QueryExecution`.
///
/// Only failures of the transport are worth retrying; SQL errors are not.
pub(crate) fn fetch_error(table: &str, error: sqlx::Error) -> DbVaultError {
    if matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    ) {
        DbVaultError::chunk_io(table, error)
    } else {
        DbVaultError::query_failed(format!("Failed to fetch rows from '{}'", table), error)
    }
}

/// Maps a failure while writing rows during restore.
pub(crate) fn load_error(table: &str, error: sqlx::Error) -> DbVaultError {
    DbVaultError::query_failed(format!("Failed to write rows into '{}'", table), error)
}

/// Number of rows per statement that keeps bound parameters under `max_params`.
pub(crate) fn rows_per_statement(columns: usize, max_params: usize) -> usize {
    if columns == 0 {
        return 1;
    }
    (max_params / columns).max(1)
}
