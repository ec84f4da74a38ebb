//! Schema capture on top of a database adapter.

use crate::Result;
use crate::adapters::DatabaseAdapter;
use crate::config::TableFilter;
use crate::error::DbVaultError;
use crate::models::SchemaSnapshot;

/// Captures an immutable [`SchemaSnapshot`] from a live database.
///
/// Introspection is read-only and all-or-nothing: whatever goes wrong
/// mid-pass (a failed catalog query, a dropped connection) is reported as
/// [`DbVaultError::Introspection`] and no snapshot is produced.
pub struct SchemaAnalyzer<'a> {
    adapter: &'a dyn DatabaseAdapter,
}

impl<'a> SchemaAnalyzer<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter) -> Self {
        Self { adapter }
    }

    /// Introspects every user table.
    pub async fn analyze(&self) -> Result<SchemaSnapshot> {
        tracing::info!("Introspecting {} schema", self.adapter.database_type());

        let snapshot = match self.adapter.introspect().await {
            Ok(snapshot) => snapshot,
            Err(error @ DbVaultError::Introspection { .. }) => return Err(error),
            Err(other) => {
                return Err(DbVaultError::introspection_failed(
                    "Introspection aborted",
                    other,
                ));
            }
        };

        let self_references = snapshot
            .edges()
            .iter()
            .filter(|edge| edge.is_self_reference())
            .count();
        tracing::debug!(
            "Snapshot has {} tables, {} edges ({} self-referencing)",
            snapshot.len(),
            snapshot.edges().len(),
            self_references
        );
        Ok(snapshot)
    }

    /// Introspects and keeps only the tables accepted by `filter`.
    pub async fn analyze_filtered(&self, filter: &TableFilter) -> Result<SchemaSnapshot> {
        let snapshot = self.analyze().await?;
        if filter.is_empty() {
            return Ok(snapshot);
        }
        let filtered = snapshot.filtered(filter);
        tracing::debug!(
            "Table filter kept {} of {} tables",
            filtered.len(),
            snapshot.len()
        );
        Ok(filtered)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteAdapter;

    #[tokio::test]
    async fn test_analyze_filtered_keeps_edges_on_tables() {
        let adapter = SqliteAdapter::new("sqlite::memory:").await.unwrap();
        for statement in [
            "CREATE TABLE authors (id INTEGER PRIMARY KEY)",
            "CREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER REFERENCES authors(id))",
        ] {
            sqlx::query(statement).execute(&adapter.pool).await.unwrap();
        }

        let analyzer = SchemaAnalyzer::new(&adapter);
        let filtered = analyzer
            .analyze_filtered(&TableFilter::default().include("books"))
            .await
            .unwrap();

        assert_eq!(filtered.table_names(), vec!["books"]);
        assert_eq!(filtered.edges().len(), 1);
        assert_eq!(filtered.edges()[0].parent_table, "authors");
    }

    #[tokio::test]
    async fn test_closed_pool_is_introspection_error() {
        let adapter = SqliteAdapter::new("sqlite::memory:").await.unwrap();
        adapter.close().await;

        let error = SchemaAnalyzer::new(&adapter).analyze().await.unwrap_err();
        assert!(matches!(error, DbVaultError::Introspection { .. }));
    }
}
