//! PostgreSQL schema introspection through the system catalogs.
//!
//! Reads `pg_class`, `pg_attribute`, `pg_constraint` and `pg_index` for one
//! schema. Any failing query aborts the whole pass.

use super::PostgresAdapter;
use super::type_mapping::map_postgresql_type;
use crate::Result;
use crate::adapters::helpers::RowExt;
use crate::error::DbVaultError;
use crate::models::*;
use std::collections::BTreeMap;

pub(crate) async fn introspect(adapter: &PostgresAdapter) -> Result<SchemaSnapshot> {
    let start_time = std::time::Instant::now();
    let schema = adapter.schema();
    let table_names = list_tables(adapter).await?;

    let mut tables = Vec::with_capacity(table_names.len());
    for table_name in table_names {
        let columns = collect_columns(adapter, schema, &table_name).await?;
        let (primary_key, indexes) = collect_keys_and_indexes(adapter, schema, &table_name).await?;
        let foreign_keys = collect_foreign_keys(adapter, schema, &table_name, &columns).await?;

        tracing::debug!(
            "Collected table '{}.{}' with {} columns, {} foreign keys, {} indexes",
            schema,
            table_name,
            columns.len(),
            foreign_keys.len(),
            indexes.len()
        );

        tables.push(TableMetadata {
            name: table_name,
            columns,
            primary_key,
            indexes,
            foreign_keys,
        });
    }

    let snapshot = SchemaSnapshot::new(DatabaseType::PostgreSQL, tables);
    tracing::info!(
        "PostgreSQL introspection of schema '{}' completed in {:.2}s - {} tables, {} foreign keys",
        schema,
        start_time.elapsed().as_secs_f64(),
        snapshot.len(),
        snapshot.edges().len()
    );
    Ok(snapshot)
}

/// Ordinary and partitioned tables of the adapter's schema, sorted.
pub(crate) async fn list_tables(adapter: &PostgresAdapter) -> Result<Vec<String>> {
    sqlx::query_scalar(
        r#"
        SELECT c.relname::text
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
        AND c.relkind IN ('r', 'p')
        AND NOT c.relispartition
        ORDER BY c.relname
        "#,
    )
    .bind(adapter.schema())
    .fetch_all(&adapter.pool)
    .await
    .map_err(|e| DbVaultError::introspection_failed("Failed to enumerate tables", e))
}

async fn collect_columns(
    adapter: &PostgresAdapter,
    schema: &str,
    table_name: &str,
) -> Result<Vec<ColumnMetadata>> {
    let rows = sqlx::query(
        r#"
        SELECT
            a.attname::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS declared_type,
            t.typname::text AS udt_name,
            a.attnotnull AS not_null,
            pg_get_expr(d.adbin, d.adrelid) AS default_value,
            a.attidentity::text AS identity,
            a.attgenerated::text AS generated
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_type t ON t.oid = a.atttypid
        LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
        WHERE n.nspname = $1
        AND c.relname = $2
        AND a.attnum > 0
        AND NOT a.attisdropped
        ORDER BY a.attnum
        "#,
    )
    .bind(schema)
    .bind(table_name)
    .fetch_all(&adapter.pool)
    .await
    .map_err(|e| {
        DbVaultError::introspection_failed(
            format!("Failed to collect columns for table '{}.{}'", schema, table_name),
            e,
        )
    })?;

    let mut columns = Vec::with_capacity(rows.len());
    for (position, row) in rows.iter().enumerate() {
        let name: String = row.get_field("column_name", Some(table_name))?;
        let declared_type: String = row.get_field("declared_type", Some(table_name))?;
        let udt_name: String = row.get_field("udt_name", Some(table_name))?;
        let not_null: bool = row.get_field("not_null", Some(table_name))?;
        let default_value: Option<String> = row.get_field("default_value", Some(table_name))?;
        let identity: String = row.get_field("identity", Some(table_name))?;
        let generated: String = row.get_field("generated", Some(table_name))?;

        if !identity.is_empty() || !generated.is_empty() {
            tracing::warn!(
                "Column '{}.{}' is an identity or generated column; it is restored as a plain column",
                table_name,
                name
            );
        }

        columns.push(ColumnMetadata {
            data_type: map_postgresql_type(&udt_name, &declared_type),
            name,
            declared_type,
            is_nullable: !not_null,
            default_value,
            ordinal_position: u32::try_from(position).unwrap_or(u32::MAX),
        });
    }
    Ok(columns)
}

/// Primary key plus every non-partial, non-expression index.
async fn collect_keys_and_indexes(
    adapter: &PostgresAdapter,
    schema: &str,
    table_name: &str,
) -> Result<(Vec<String>, Vec<IndexMetadata>)> {
    let rows = sqlx::query(
        r#"
        SELECT
            i.relname::text AS index_name,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary,
            (ix.indpred IS NOT NULL) AS is_partial,
            (0 = ANY(ix.indkey::int2[])) AS has_expression,
            EXISTS (
                SELECT 1 FROM pg_constraint con
                WHERE con.conindid = ix.indexrelid AND con.contype = 'u'
            ) AS is_constraint,
            ARRAY(
                SELECT a.attname::text
                FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS column_names
        FROM pg_index ix
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        WHERE n.nspname = $1
        AND t.relname = $2
        ORDER BY i.relname
        "#,
    )
    .bind(schema)
    .bind(table_name)
    .fetch_all(&adapter.pool)
    .await
    .map_err(|e| {
        DbVaultError::introspection_failed(
            format!("Failed to collect indexes for table '{}.{}'", schema, table_name),
            e,
        )
    })?;

    let mut primary_key = Vec::new();
    let mut indexes = Vec::with_capacity(rows.len());

    for row in &rows {
        let name: String = row.get_field("index_name", Some(table_name))?;
        let is_partial: bool = row.get_field("is_partial", Some(table_name))?;
        let has_expression: bool = row.get_field("has_expression", Some(table_name))?;
        if is_partial || has_expression {
            tracing::warn!(
                "Skipping partial or expression index '{}' on '{}'",
                name,
                table_name
            );
            continue;
        }

        let is_primary: bool = row.get_field("is_primary", Some(table_name))?;
        let is_constraint: bool = row.get_field("is_constraint", Some(table_name))?;
        let columns: Vec<String> = row.get_field("column_names", Some(table_name))?;

        if is_primary {
            primary_key = columns.clone();
        }

        indexes.push(IndexMetadata {
            name,
            columns,
            is_unique: row.get_field("is_unique", Some(table_name))?,
            origin: if is_primary {
                IndexOrigin::PrimaryKey
            } else if is_constraint {
                IndexOrigin::UniqueConstraint
            } else {
                IndexOrigin::Explicit
            },
        });
    }

    Ok((primary_key, indexes))
}

async fn collect_foreign_keys(
    adapter: &PostgresAdapter,
    schema: &str,
    table_name: &str,
    columns: &[ColumnMetadata],
) -> Result<Vec<RelationshipEdge>> {
    let rows = sqlx::query(
        r#"
        SELECT
            con.conname::text AS constraint_name,
            con.confupdtype::text AS update_code,
            con.confdeltype::text AS delete_code,
            a.attname::text AS column_name,
            fcl.relname::text AS referenced_table_name,
            fa.attname::text AS referenced_column_name,
            k.ord::integer AS position
        FROM pg_constraint con
        JOIN pg_class cl ON con.conrelid = cl.oid
        JOIN pg_namespace ns ON cl.relnamespace = ns.oid
        JOIN pg_class fcl ON con.confrelid = fcl.oid
        CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, fattnum, ord)
        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
        JOIN pg_attribute fa ON fa.attrelid = con.confrelid AND fa.attnum = k.fattnum
        WHERE con.contype = 'f'
        AND ns.nspname = $1
        AND cl.relname = $2
        ORDER BY con.conname, k.ord
        "#,
    )
    .bind(schema)
    .bind(table_name)
    .fetch_all(&adapter.pool)
    .await
    .map_err(|e| {
        DbVaultError::introspection_failed(
            format!("Failed to collect foreign keys for table '{}.{}'", schema, table_name),
            e,
        )
    })?;

    // Group by constraint name
    let mut groups: BTreeMap<String, RelationshipEdge> = BTreeMap::new();
    for row in &rows {
        let constraint_name: String = row.get_field("constraint_name", Some(table_name))?;
        let column: String = row.get_field("column_name", Some(table_name))?;
        let referenced_column: String =
            row.get_field("referenced_column_name", Some(table_name))?;

        if !groups.contains_key(&constraint_name) {
            let update_code: String = row.get_field("update_code", Some(table_name))?;
            let delete_code: String = row.get_field("delete_code", Some(table_name))?;
            groups.insert(
                constraint_name.clone(),
                RelationshipEdge {
                    name: Some(constraint_name.clone()),
                    child_table: table_name.to_string(),
                    child_columns: Vec::new(),
                    parent_table: row.get_field("referenced_table_name", Some(table_name))?,
                    parent_columns: Vec::new(),
                    nullable: false,
                    on_delete: map_action_code(&delete_code),
                    on_update: map_action_code(&update_code),
                },
            );
        }

        if let Some(edge) = groups.get_mut(&constraint_name) {
            edge.child_columns.push(column);
            edge.parent_columns.push(referenced_column);
        }
    }

    let mut edges: Vec<RelationshipEdge> = groups.into_values().collect();
    for edge in &mut edges {
        edge.nullable = edge.child_columns.iter().any(|name| {
            columns
                .iter()
                .find(|column| &column.name == name)
                .is_none_or(|column| column.is_nullable)
        });
    }
    edges.sort_by(|a, b| {
        (&a.parent_table, &a.child_columns).cmp(&(&b.parent_table, &b.child_columns))
    });
    Ok(edges)
}

/// Maps `pg_constraint.confupdtype`/`confdeltype` codes.
pub(crate) fn map_action_code(code: &str) -> ReferentialAction {
    match code {
        "c" => ReferentialAction::Cascade,
        "n" => ReferentialAction::SetNull,
        "d" => ReferentialAction::SetDefault,
        "r" => ReferentialAction::Restrict,
        _ => ReferentialAction::NoAction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_action_code() {
        assert_eq!(map_action_code("c"), ReferentialAction::Cascade);
        assert_eq!(map_action_code("n"), ReferentialAction::SetNull);
        assert_eq!(map_action_code("a"), ReferentialAction::NoAction);
    }
}
