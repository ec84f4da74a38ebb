//! SQLite schema introspection.
//!
//! # SQLite System Tables
//! - `sqlite_master`: Contains schema definitions for all database objects
//! - `PRAGMA table_info()`: Returns column information for a table
//! - `PRAGMA foreign_key_list()`: Returns foreign key information
//! - `PRAGMA index_list()`: Returns index information
//! - `PRAGMA index_info()`: Returns columns in an index

use super::SqliteAdapter;
use super::type_mapping::map_sqlite_type;
use crate::Result;
use crate::adapters::helpers::RowExt;
use crate::error::DbVaultError;
use crate::models::*;
use std::collections::{BTreeMap, HashMap};

/// Raw foreign-key pragma row, grouped later by constraint id
struct ForeignKeyRow {
    parent_table: String,
    from: String,
    to: Option<String>,
    on_update: String,
    on_delete: String,
}

/// Collects the full snapshot; any failed pragma aborts the pass.
pub(crate) async fn introspect(adapter: &SqliteAdapter) -> Result<SchemaSnapshot> {
    let start_time = std::time::Instant::now();
    let table_names = list_tables(adapter).await?;

    let mut tables = Vec::with_capacity(table_names.len());
    let mut raw_foreign_keys = HashMap::new();

    for table_name in &table_names {
        let (columns, primary_key) = collect_columns(adapter, table_name).await?;
        let indexes = collect_indexes(adapter, table_name).await?;
        raw_foreign_keys.insert(
            table_name.clone(),
            collect_foreign_key_rows(adapter, table_name).await?,
        );

        tables.push(TableMetadata {
            name: table_name.clone(),
            columns,
            primary_key,
            indexes,
            foreign_keys: Vec::new(),
        });
    }

    // Foreign keys may omit the parent columns; they then mean the parent's
    // primary key, which is only known once every table has been read.
    let primary_keys: HashMap<String, Vec<String>> = tables
        .iter()
        .map(|t| (t.name.clone(), t.primary_key.clone()))
        .collect();

    for table in &mut tables {
        let rows = raw_foreign_keys.remove(&table.name).unwrap_or_default();
        table.foreign_keys = build_edges(adapter, table, rows, &primary_keys).await?;
        tracing::debug!(
            "Collected table '{}' with {} columns, {} foreign keys, {} indexes",
            table.name,
            table.columns.len(),
            table.foreign_keys.len(),
            table.indexes.len()
        );
    }

    let snapshot = SchemaSnapshot::new(DatabaseType::SQLite, tables);
    tracing::info!(
        "SQLite introspection completed in {:.2}s - {} tables, {} foreign keys",
        start_time.elapsed().as_secs_f64(),
        snapshot.len(),
        snapshot.edges().len()
    );
    Ok(snapshot)
}

/// User tables, sorted by name.
pub(crate) async fn list_tables(adapter: &SqliteAdapter) -> Result<Vec<String>> {
    sqlx::query_scalar(
        r#"
        SELECT name
        FROM sqlite_master
        WHERE type = 'table'
        AND name NOT LIKE 'sqlite_%'
        ORDER BY name
        "#,
    )
    .fetch_all(&adapter.pool)
    .await
    .map_err(|e| DbVaultError::introspection_failed("Failed to enumerate tables", e))
}

fn pragma(name: &str, argument: &str) -> String {
    format!("PRAGMA {}('{}')", name, argument.replace('\'', "''"))
}

async fn collect_columns(
    adapter: &SqliteAdapter,
    table_name: &str,
) -> Result<(Vec<ColumnMetadata>, Vec<String>)> {
    let rows = sqlx::query(&pragma("table_info", table_name))
        .fetch_all(&adapter.pool)
        .await
        .map_err(|e| {
            DbVaultError::introspection_failed(
                format!("Failed to collect columns for table '{}'", table_name),
                e,
            )
        })?;

    let mut columns = Vec::with_capacity(rows.len());
    let mut primary_key: Vec<(i64, String)> = Vec::new();

    for row in &rows {
        let cid: i64 = row.get_field("cid", Some(table_name))?;
        let name: String = row.get_field("name", Some(table_name))?;
        let declared_type: String = row.get_field("type", Some(table_name))?;
        let notnull: i64 = row.get_field("notnull", Some(table_name))?;
        let default_value: Option<String> = row.get_field("dflt_value", Some(table_name))?;
        let pk: i64 = row.get_field("pk", Some(table_name))?;

        if pk > 0 {
            primary_key.push((pk, name.clone()));
        }

        columns.push(ColumnMetadata {
            data_type: map_sqlite_type(&declared_type),
            // Primary key columns are treated as NOT NULL
            is_nullable: notnull == 0 && pk == 0,
            ordinal_position: u32::try_from(cid).unwrap_or_default(),
            name,
            declared_type,
            default_value,
        });
    }

    primary_key.sort();
    Ok((
        columns,
        primary_key.into_iter().map(|(_, name)| name).collect(),
    ))
}

async fn collect_foreign_key_rows(
    adapter: &SqliteAdapter,
    table_name: &str,
) -> Result<BTreeMap<i64, Vec<ForeignKeyRow>>> {
    let rows = sqlx::query(&pragma("foreign_key_list", table_name))
        .fetch_all(&adapter.pool)
        .await
        .map_err(|e| {
            DbVaultError::introspection_failed(
                format!("Failed to collect foreign keys for table '{}'", table_name),
                e,
            )
        })?;

    let mut grouped: BTreeMap<i64, Vec<(i64, ForeignKeyRow)>> = BTreeMap::new();
    for row in &rows {
        let id: i64 = row.get_field("id", Some(table_name))?;
        let seq: i64 = row.get_field("seq", Some(table_name))?;
        grouped.entry(id).or_default().push((
            seq,
            ForeignKeyRow {
                parent_table: row.get_field("table", Some(table_name))?,
                from: row.get_field("from", Some(table_name))?,
                to: row.get_field("to", Some(table_name))?,
                on_update: row.get_field("on_update", Some(table_name))?,
                on_delete: row.get_field("on_delete", Some(table_name))?,
            },
        ));
    }

    Ok(grouped
        .into_iter()
        .map(|(id, mut parts)| {
            parts.sort_by_key(|(seq, _)| *seq);
            (id, parts.into_iter().map(|(_, part)| part).collect())
        })
        .collect())
}

async fn build_edges(
    adapter: &SqliteAdapter,
    table: &TableMetadata,
    grouped: BTreeMap<i64, Vec<ForeignKeyRow>>,
    primary_keys: &HashMap<String, Vec<String>>,
) -> Result<Vec<RelationshipEdge>> {
    let mut edges = Vec::with_capacity(grouped.len());

    for parts in grouped.into_values() {
        let Some(first) = parts.first() else {
            continue;
        };
        let parent_table = first.parent_table.clone();
        let child_columns: Vec<String> = parts.iter().map(|p| p.from.clone()).collect();

        let mut parent_columns: Vec<String> =
            parts.iter().filter_map(|p| p.to.clone()).collect();
        if parent_columns.len() != child_columns.len() {
            parent_columns = match primary_keys.get(&parent_table) {
                Some(pk) => pk.clone(),
                // Parent outside the snapshot (or missing): ask it directly
                None => collect_columns(adapter, &parent_table).await?.1,
            };
        }

        let nullable = child_columns.iter().any(|name| {
            table
                .column(name)
                .is_none_or(|column| column.is_nullable)
        });

        edges.push(RelationshipEdge {
            name: None,
            child_table: table.name.clone(),
            child_columns,
            parent_table,
            parent_columns,
            nullable,
            on_delete: ReferentialAction::parse(&first.on_delete),
            on_update: ReferentialAction::parse(&first.on_update),
        });
    }

    // Pragma ids are not stable across a re-create; sort for determinism.
    edges.sort_by(|a, b| {
        (&a.parent_table, &a.child_columns).cmp(&(&b.parent_table, &b.child_columns))
    });
    Ok(edges)
}

async fn collect_indexes(adapter: &SqliteAdapter, table_name: &str) -> Result<Vec<IndexMetadata>> {
    let index_rows = sqlx::query(&pragma("index_list", table_name))
        .fetch_all(&adapter.pool)
        .await
        .map_err(|e| {
            DbVaultError::introspection_failed(
                format!("Failed to collect indexes for table '{}'", table_name),
                e,
            )
        })?;

    let mut indexes = Vec::with_capacity(index_rows.len());
    for row in &index_rows {
        let name: String = row.get_field("name", Some(table_name))?;
        let unique: i64 = row.get_field("unique", Some(table_name))?;
        let origin: String = row.get_field("origin", Some(table_name))?;
        let partial: i64 = row.get_field("partial", Some(table_name))?;

        if partial != 0 {
            tracing::warn!(
                "Skipping partial index '{}' on '{}': predicates are not captured",
                name,
                table_name
            );
            continue;
        }

        let column_rows = sqlx::query(&pragma("index_info", &name))
            .fetch_all(&adapter.pool)
            .await
            .map_err(|e| {
                DbVaultError::introspection_failed(
                    format!("Failed to collect columns for index '{}'", name),
                    e,
                )
            })?;

        let mut columns: Vec<(i64, Option<String>)> = Vec::with_capacity(column_rows.len());
        for column_row in &column_rows {
            columns.push((
                column_row.get_field("seqno", Some(table_name))?,
                column_row.get_field("name", Some(table_name))?,
            ));
        }
        columns.sort_by_key(|(seqno, _)| *seqno);

        if columns.iter().any(|(_, column)| column.is_none()) {
            tracing::warn!(
                "Skipping expression index '{}' on '{}'",
                name,
                table_name
            );
            continue;
        }

        indexes.push(IndexMetadata {
            name,
            columns: columns.into_iter().filter_map(|(_, c)| c).collect(),
            is_unique: unique != 0,
            origin: match origin.as_str() {
                "pk" => IndexOrigin::PrimaryKey,
                "u" => IndexOrigin::UniqueConstraint,
                _ => IndexOrigin::Explicit,
            },
        });
    }

    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(indexes)
}
