//! Row streaming and restore loading for PostgreSQL.
//!
//! Cells travel as their text rendering (`col::text`) and are cast back to
//! the declared column type on insert, which round-trips every built-in type
//! without per-type decoding.

use super::PostgresAdapter;
use crate::Result;
use crate::adapters::helpers::{fetch_error, load_error, rows_per_statement};
use crate::adapters::{RowWindow, TableLoader};
use crate::ddl::Dialect;
use crate::error::DbVaultError;
use crate::models::{CellValue, Row, TableMetadata};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow, Postgres};
use sqlx::{Row as _, Transaction};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Bind parameter limit of the wire protocol
const MAX_BOUND_PARAMETERS: usize = 65_535;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn quote(name: &str) -> String {
    Dialect::Postgres.quote_ident(name)
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

/// `$index` cast from text to the declared column type, when there is one.
fn typed_placeholder(index: usize, declared: Option<&str>) -> String {
    match declared {
        Some(declared) if !declared.is_empty() => {
            format!("CAST(${}::text AS {})", index, declared)
        }
        _ => format!("${}", index),
    }
}

/// Builds the windowed SELECT for a table.
///
/// A keyset window binds the text of its key values as `$1..$n`.
pub(crate) fn select_sql(schema: &str, table: &TableMetadata, window: &RowWindow) -> String {
    let columns = table
        .columns
        .iter()
        .map(|column| format!("{}::text", quote(&column.name)))
        .collect::<Vec<_>>()
        .join(", ");

    let key = table
        .primary_key
        .iter()
        .map(|column| quote(column))
        .collect::<Vec<_>>()
        .join(", ");
    let order_by = if table.primary_key.is_empty() {
        "ctid".to_string()
    } else {
        key.clone()
    };

    let mut sql = format!(
        "SELECT {} FROM {}",
        columns,
        qualified(schema, &table.name)
    );
    if window.after.is_some() && !table.primary_key.is_empty() {
        let bounds = table
            .primary_key
            .iter()
            .enumerate()
            .map(|(position, name)| {
                let declared = table
                    .columns
                    .iter()
                    .find(|column| &column.name == name)
                    .map(|column| column.declared_type.as_str());
                typed_placeholder(position + 1, declared)
            })
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(sql, " WHERE ({}) > ({})", key, bounds);
    }
    let _ = write!(sql, " ORDER BY {}", order_by);
    if let Some(limit) = window.limit {
        let _ = write!(sql, " LIMIT {}", limit);
    }
    let _ = write!(sql, " OFFSET {}", window.offset);
    sql
}

pub(crate) async fn count_rows(adapter: &PostgresAdapter, table: &TableMetadata) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {}",
        qualified(adapter.schema(), &table.name)
    ))
    .fetch_one(&adapter.pool)
    .await
    .map_err(|e| fetch_error(&table.name, e))?;
    Ok(u64::try_from(count).unwrap_or_default())
}

pub(crate) async fn fetch_rows(
    adapter: &PostgresAdapter,
    table: &TableMetadata,
    window: RowWindow,
) -> Result<Vec<Row>> {
    if window.after.as_ref().is_some_and(|key| key.len() != table.primary_key.len()) {
        return Err(DbVaultError::configuration(format!(
            "keyset window for '{}' does not match its primary key",
            table.name
        )));
    }
    let sql = select_sql(adapter.schema(), table, &window);
    let mut query = sqlx::query(&sql);
    for cell in window.after.iter().flatten() {
        query = bind_cell(query, cell);
    }
    let rows = query
        .fetch_all(&adapter.pool)
        .await
        .map_err(|e| fetch_error(&table.name, e))?;

    rows.iter()
        .map(|row| decode_row(row, &table.name))
        .collect()
}

fn decode_row(row: &PgRow, table: &str) -> Result<Row> {
    (0..row.len())
        .map(|index| {
            row.try_get::<Option<String>, _>(index)
                .map(|value| value.map_or(CellValue::Null, CellValue::Text))
                .map_err(|e| fetch_error(table, e))
        })
        .collect()
}

/// Text rendering accepted by a cast to the column's declared type.
fn cell_text(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Null => None,
        CellValue::Bool(value) => Some(value.to_string()),
        CellValue::Integer(value) => Some(value.to_string()),
        CellValue::Real(value) => Some(value.to_string()),
        CellValue::Text(value) => Some(value.clone()),
        // bytea hex input format
        CellValue::Blob { bytes } => Some(format!("\\x{}", hex::encode(bytes))),
        CellValue::Json { json } => Some(json.to_string()),
    }
}

fn bind_cell<'q>(query: PgQuery<'q>, cell: &CellValue) -> PgQuery<'q> {
    query.bind(cell_text(cell))
}

/// Per-table write transaction.
pub struct PostgresLoader {
    schema: String,
    table: TableMetadata,
    column_types: HashMap<String, String>,
    tx: Transaction<'static, Postgres>,
}

impl PostgresLoader {
    pub(crate) async fn begin(adapter: &PostgresAdapter, table: &TableMetadata) -> Result<Self> {
        let mut tx = adapter
            .pool
            .begin()
            .await
            .map_err(DbVaultError::connection_failed)?;
        sqlx::query("SET CONSTRAINTS ALL DEFERRED")
            .execute(&mut *tx)
            .await
            .map_err(|e| load_error(&table.name, e))?;

        Ok(Self {
            schema: adapter.schema().to_string(),
            column_types: table
                .columns
                .iter()
                .map(|column| (column.name.clone(), column.declared_type.clone()))
                .collect(),
            table: table.clone(),
            tx,
        })
    }

    fn placeholder(&self, index: usize, column: &str) -> String {
        typed_placeholder(index, self.column_types.get(column).map(String::as_str))
    }

    fn insert_sql(&self, columns: &[String], row_count: usize) -> String {
        let mut groups = Vec::with_capacity(row_count);
        let mut index = 1;
        for _ in 0..row_count {
            let group: Vec<String> = columns
                .iter()
                .map(|column| {
                    let placeholder = self.placeholder(index, column);
                    index += 1;
                    placeholder
                })
                .collect();
            groups.push(format!("({})", group.join(", ")));
        }
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            qualified(&self.schema, &self.table.name),
            columns
                .iter()
                .map(|column| quote(column))
                .collect::<Vec<_>>()
                .join(", "),
            groups.join(", ")
        )
    }

    fn update_sql(&self, key_columns: &[String], set_columns: &[String]) -> String {
        let mut index = 0;
        let mut next = |column: &String| {
            index += 1;
            format!("{} = {}", quote(column), self.placeholder(index, column))
        };
        let assignments: Vec<String> = set_columns.iter().map(&mut next).collect();
        let predicate: Vec<String> = key_columns.iter().map(&mut next).collect();
        format!(
            "UPDATE {} SET {} WHERE {}",
            qualified(&self.schema, &self.table.name),
            assignments.join(", "),
            predicate.join(" AND ")
        )
    }

    /// Moves serial sequences past the restored keys.
    async fn sync_sequences(&mut self) -> Result<()> {
        let serial_columns: Vec<String> = self
            .table
            .columns
            .iter()
            .filter(|column| {
                column
                    .default_value
                    .as_deref()
                    .is_some_and(|default| default.starts_with("nextval("))
            })
            .map(|column| column.name.clone())
            .collect();

        let qualified_table = qualified(&self.schema, &self.table.name);
        for column in serial_columns {
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence($1, $2), COALESCE(MAX({}), 0) + 1, false) FROM {}",
                quote(&column),
                qualified_table
            );
            sqlx::query(&sql)
                .bind(&qualified_table)
                .bind(&column)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| load_error(&self.table.name, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TableLoader for PostgresLoader {
    async fn insert_rows(&mut self, columns: &[String], rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let batch = rows_per_statement(columns.len(), MAX_BOUND_PARAMETERS);

        for chunk in rows.chunks(batch) {
            let sql = self.insert_sql(columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                if row.len() != columns.len() {
                    return Err(DbVaultError::configuration(format!(
                        "Row for '{}' has {} cells, expected {}",
                        self.table.name,
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
                .map_err(|e| load_error(&self.table.name, e))?;
        }
        Ok(())
    }

    async fn update_rows(
        &mut self,
        key_columns: &[String],
        set_columns: &[String],
        rows: &[Row],
    ) -> Result<()> {
        let sql = self.update_sql(key_columns, set_columns);
        for row in rows {
            if row.len() != key_columns.len() + set_columns.len() {
                return Err(DbVaultError::configuration(format!(
                    "Update row for '{}' has {} cells, expected {}",
                    self.table.name,
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
                .map_err(|e| load_error(&self.table.name, e))?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut loader = self;
        loader.sync_sequences().await?;
        let Self { table, tx, .. } = *loader;
        tx.commit().await.map_err(|e| load_error(&table.name, e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { table, tx, .. } = *self;
        tx.rollback().await.map_err(|e| load_error(&table.name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnMetadata, UnifiedDataType};

    fn accounts() -> TableMetadata {
        TableMetadata {
            name: "accounts".to_string(),
            columns: vec![ColumnMetadata {
                name: "id".to_string(),
                declared_type: "bigint".to_string(),
                data_type: UnifiedDataType::Integer {
                    bits: 64,
                    signed: true,
                },
                is_nullable: false,
                default_value: None,
                ordinal_position: 0,
            }],
            primary_key: vec!["id".to_string()],
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    #[test]
    fn test_select_sql_orders_by_primary_key() {
        let sql = select_sql("billing", &accounts(), &RowWindow::chunk(100, 50));
        assert_eq!(
            sql,
            "SELECT \"id\"::text FROM \"billing\".\"accounts\" ORDER BY \"id\" LIMIT 50 OFFSET 100"
        );

        let mut heap = accounts();
        heap.primary_key.clear();
        let sql = select_sql("public", &heap, &RowWindow::all());
        assert!(sql.ends_with("ORDER BY ctid OFFSET 0"));
    }

    #[test]
    fn test_select_sql_keyset_casts_key_values() {
        let window = RowWindow::after_key(vec![CellValue::Text("9000".to_string())], 50);
        let sql = select_sql("billing", &accounts(), &window);
        assert_eq!(
            sql,
            "SELECT \"id\"::text FROM \"billing\".\"accounts\" WHERE (\"id\") > (CAST($1::text AS bigint)) ORDER BY \"id\" LIMIT 50 OFFSET 0"
        );
    }

    #[test]
    fn test_cell_text_renderings() {
        assert_eq!(cell_text(&CellValue::Null), None);
        assert_eq!(cell_text(&CellValue::Bool(true)).as_deref(), Some("true"));
        assert_eq!(
            cell_text(&CellValue::Blob {
                bytes: vec![0x01, 0xab]
            })
            .as_deref(),
            Some("\\x01ab")
        );
    }
}
