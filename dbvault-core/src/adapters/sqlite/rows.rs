//! Row streaming and restore loading for SQLite.
//!
//! Cells are read with their storage class so that a restore writes back
//! exactly what was stored, whatever the declared column type says.

use crate::Result;
use crate::adapters::helpers::{fetch_error, load_error, rows_per_statement};
use crate::adapters::{RowWindow, TableLoader};
use crate::ddl::Dialect;
use crate::error::DbVaultError;
use crate::models::{CellValue, Row, TableMetadata};
use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row as _, SqlitePool, Transaction, TypeInfo, ValueRef};

/// SQLite's default `SQLITE_MAX_VARIABLE_NUMBER` on older builds
const MAX_BOUND_PARAMETERS: usize = 999;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn quote(name: &str) -> String {
    Dialect::Sqlite.quote_ident(name)
}

fn order_by(table: &TableMetadata) -> String {
    if table.primary_key.is_empty() {
        "rowid".to_string()
    } else {
        table
            .primary_key
            .iter()
            .map(|column| quote(column))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Builds the windowed SELECT for a table.
///
/// A keyset window binds its key values as positional parameters.
pub(crate) fn select_sql(table: &TableMetadata, window: &RowWindow) -> String {
    let columns = table
        .columns
        .iter()
        .map(|column| quote(&column.name))
        .collect::<Vec<_>>()
        .join(", ");

    let filter = match &window.after {
        Some(key) if !table.primary_key.is_empty() => format!(
            " WHERE ({}) > ({})",
            order_by(table),
            vec!["?"; key.len()].join(", ")
        ),
        _ => String::new(),
    };

    // LIMIT -1 means no limit in SQLite
    let limit = window
        .limit
        .map(|limit| limit.to_string())
        .unwrap_or_else(|| "-1".to_string());

    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {} OFFSET {}",
        columns,
        quote(&table.name),
        filter,
        order_by(table),
        limit,
        window.offset
    )
}

pub(crate) async fn count_rows(pool: &SqlitePool, table: &TableMetadata) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote(&table.name)))
        .fetch_one(pool)
        .await
        .map_err(|e| fetch_error(&table.name, e))?;
    Ok(u64::try_from(count).unwrap_or_default())
}

pub(crate) async fn fetch_rows(
    pool: &SqlitePool,
    table: &TableMetadata,
    window: RowWindow,
) -> Result<Vec<Row>> {
    if window.after.as_ref().is_some_and(|key| key.len() != table.primary_key.len()) {
        return Err(DbVaultError::configuration(format!(
            "keyset window for '{}' does not match its primary key",
            table.name
        )));
    }
    let sql = select_sql(table, &window);
    let mut query = sqlx::query(&sql);
    for cell in window.after.iter().flatten() {
        query = bind_cell(query, cell);
    }
    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| fetch_error(&table.name, e))?;

    rows.iter()
        .map(|row| decode_row(row, &table.name))
        .collect()
}

fn decode_row(row: &SqliteRow, table: &str) -> Result<Row> {
    (0..row.len())
        .map(|index| decode_cell(row, index, table))
        .collect()
}

fn decode_cell(row: &SqliteRow, index: usize, table: &str) -> Result<CellValue> {
    let storage_class = {
        let raw = row
            .try_get_raw(index)
            .map_err(|e| fetch_error(table, e))?;
        if raw.is_null() {
            return Ok(CellValue::Null);
        }
        raw.type_info().name().to_string()
    };

    let cell = match storage_class.as_str() {
        "INTEGER" => row.try_get_unchecked::<i64, _>(index).map(CellValue::Integer),
        "REAL" => row.try_get_unchecked::<f64, _>(index).map(CellValue::Real),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|bytes| CellValue::Blob { bytes }),
        _ => row.try_get_unchecked::<String, _>(index).map(CellValue::Text),
    };
    cell.map_err(|e| fetch_error(table, e))
}

fn bind_cell<'q>(query: SqliteQuery<'q>, cell: &CellValue) -> SqliteQuery<'q> {
    match cell {
        CellValue::Null => query.bind(None::<String>),
        CellValue::Bool(value) => query.bind(*value),
        CellValue::Integer(value) => query.bind(*value),
        CellValue::Real(value) => query.bind(*value),
        CellValue::Text(value) => query.bind(value.clone()),
        CellValue::Blob { bytes } => query.bind(bytes.clone()),
        CellValue::Json { json } => query.bind(json.to_string()),
    }
}

/// Multi-row INSERT with one placeholder group per row.
pub(crate) fn insert_sql(table: &str, columns: &[String], row_count: usize) -> String {
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote(table),
        columns
            .iter()
            .map(|column| quote(column))
            .collect::<Vec<_>>()
            .join(", "),
        vec![placeholders; row_count].join(", ")
    )
}

pub(crate) fn update_sql(table: &str, key_columns: &[String], set_columns: &[String]) -> String {
    let assignments = set_columns
        .iter()
        .map(|column| format!("{} = ?", quote(column)))
        .collect::<Vec<_>>()
        .join(", ");
    let predicate = key_columns
        .iter()
        .map(|column| format!("{} = ?", quote(column)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "UPDATE {} SET {} WHERE {}",
        quote(table),
        assignments,
        predicate
    )
}

/// Per-table write transaction.
///
/// Foreign keys are checked at commit, so rows may arrive in any order
/// within the table.
pub struct SqliteLoader {
    table: String,
    tx: Transaction<'static, Sqlite>,
}

impl SqliteLoader {
    pub(crate) async fn begin(pool: &SqlitePool, table: &str) -> Result<Self> {
        let mut tx = pool.begin().await.map_err(DbVaultError::connection_failed)?;
        sqlx::query("PRAGMA defer_foreign_keys = ON")
            .execute(&mut *tx)
            .await
            .map_err(|e| load_error(table, e))?;
        Ok(Self {
            table: table.to_string(),
            tx,
        })
    }
}

#[async_trait]
impl TableLoader for SqliteLoader {
    async fn insert_rows(&mut self, columns: &[String], rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let batch = rows_per_statement(columns.len(), MAX_BOUND_PARAMETERS);

        for chunk in rows.chunks(batch) {
            let sql = insert_sql(&self.table, columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                if row.len() != columns.len() {
                    return Err(DbVaultError::configuration(format!(
                        "Row for '{}' has {} cells, expected {}",
                        self.table,
                        row.len(),
                        columns.len()
                    )));
                }
                for cell in row {
                    query = bind_cell(query, cell);
                }
            }
            query
                .execute(&mut *self.tx)
                .await
                .map_err(|e| load_error(&self.table, e))?;
        }
        Ok(())
    }

    async fn update_rows(
        &mut self,
        key_columns: &[String],
        set_columns: &[String],
        rows: &[Row],
    ) -> Result<()> {
        let sql = update_sql(&self.table, key_columns, set_columns);
        for row in rows {
            if row.len() != key_columns.len() + set_columns.len() {
                return Err(DbVaultError::configuration(format!(
                    "Update row for '{}' has {} cells, expected {}",
                    self.table,
                    row.len(),
                    key_columns.len() + set_columns.len()
                )));
            }
            let (keys, values) = row.split_at(key_columns.len());
            let mut query = sqlx::query(&sql);
            for cell in values.iter().chain(keys) {
                query = bind_cell(query, cell);
            }
            query
                .execute(&mut *self.tx)
                .await
                .map_err(|e| load_error(&self.table, e))?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { table, tx } = *self;
        tx.commit().await.map_err(|e| load_error(&table, e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { table, tx } = *self;
        tx.rollback().await.map_err(|e| load_error(&table, e))
    }
}
