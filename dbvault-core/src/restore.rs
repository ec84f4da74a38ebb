//! Restore of catalogued backups into a target database.
//!
//! A restore runs in four phases:
//!
//! 1. **Preflight**: the artifact body is re-hashed and compared with the
//!    footer and the catalog, the key is checked against the header, the
//!    engine and the target tables are checked. Nothing is written before
//!    all of this passes.
//! 2. **Schema**: every selected table is created in dependency order in one
//!    DDL transaction.
//! 3. **Data**: each table is loaded inside its own transaction. Columns
//!    that close a dependency cycle (or point at the same table) are loaded
//!    as NULL. A failing table is rolled back and recorded; the others go on.
//! 4. **Deferred**: the NULLed columns are updated by primary key, one
//!    transaction per table, and foreign keys that were left out of the
//!    schema phase are added.
//!
//! Any recorded failure turns the result into
//! [`DbVaultError::PartialRestore`] carrying the full [`RestoreReport`].

use crate::Result;
use crate::adapters::{DatabaseAdapter, TableLoader};
use crate::artifact::{ArtifactReader, Frame, FrameReader};
use crate::catalog::Catalog;
use crate::config::{BackupMode, TableFilter};
use crate::error::DbVaultError;
use crate::manager::completed_artifact;
use crate::models::{CellValue, DatabaseType, RelationshipEdge, Row, TableMetadata};
use crate::storage::{CipherKind, EncryptionKey};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// What to restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    pub filter: TableFilter,
    /// Create the tables (requires an artifact with table definitions)
    pub schema: bool,
    /// Load the rows (requires an artifact with row data)
    pub data: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            filter: TableFilter::default(),
            schema: true,
            data: true,
        }
    }
}

impl RestoreOptions {
    /// Builder method to set the table filter.
    pub fn with_filter(mut self, filter: TableFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Only create tables.
    pub fn schema_only(mut self) -> Self {
        self.schema = true;
        self.data = false;
        self
    }

    /// Only load rows into existing tables.
    pub fn data_only(mut self) -> Self {
        self.schema = false;
        self.data = true;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    /// Returns `Configuration` when nothing would be restored or a filter
    /// pattern is empty.
    pub fn validate(&self) -> Result<()> {
        if !self.schema && !self.data {
            return Err(DbVaultError::configuration(
                "restore must include schema, data or both",
            ));
        }
        self.filter.validate()
    }
}

/// A table that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub reason: String,
}

/// Per-table outcome of a restore
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub backup_id: Uuid,
    /// Tables fully restored, in restore order
    pub succeeded: Vec<String>,
    pub failed: Vec<TableFailure>,
    pub rows_restored: u64,
}

impl RestoreReport {
    fn new(backup_id: Uuid) -> Self {
        Self {
            backup_id,
            ..Default::default()
        }
    }

    /// True when no table failed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, table: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Restore of table '{}' failed: {}", table, reason);
        self.failed.push(TableFailure {
            table: table.to_string(),
            reason,
        });
    }

    /// Moves a table that already succeeded to the failed list.
    fn demote(&mut self, table: &str, reason: impl Into<String>) {
        self.succeeded.retain(|name| name != table);
        self.fail(table, reason);
    }

    fn is_settled(&self, table: &str) -> bool {
        self.succeeded.iter().any(|name| name == table)
            || self.failed.iter().any(|failure| failure.table == table)
    }
}

/// One table of a [`RestorePreview`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewTable {
    pub name: String,
    pub has_definition: bool,
    pub rows: u64,
}

/// What a restore of a backup would do
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestorePreview {
    pub backup_id: Uuid,
    pub name: String,
    pub mode: BackupMode,
    pub engine: DatabaseType,
    pub cipher: Option<CipherKind>,
    /// Tables in restore order
    pub tables: Vec<PreviewTable>,
    pub broken_edges: Vec<RelationshipEdge>,
    pub deferred_columns: BTreeMap<String, Vec<String>>,
    pub total_rows: u64,
}

/// Contents of the plan frame
struct Plan {
    order: Vec<String>,
    broken_edges: Vec<RelationshipEdge>,
    deferred_columns: BTreeMap<String, Vec<String>>,
}

fn read_plan(frames: &mut FrameReader) -> Result<Plan> {
    match frames.next_frame()? {
        Some(Frame::Plan {
            order,
            broken_edges,
            deferred_columns,
        }) => Ok(Plan {
            order,
            broken_edges,
            deferred_columns,
        }),
        _ => Err(DbVaultError::configuration(
            "artifact body does not start with a plan frame",
        )),
    }
}

/// Positions of `names` within `columns`, skipping unknown names.
fn positions(columns: &[String], names: &[String]) -> Vec<usize> {
    names
        .iter()
        .filter_map(|name| columns.iter().position(|column| column == name))
        .collect()
}

/// Table being loaded in the data phase
struct ActiveLoad {
    table: String,
    columns: Vec<String>,
    nulled: Vec<usize>,
    loader: Box<dyn TableLoader>,
    rows: u64,
}

/// Deferred-column update of one table
struct DeferredUpdate {
    table: String,
    keys: Vec<usize>,
    values: Vec<usize>,
    key_columns: Vec<String>,
    set_columns: Vec<String>,
    loader: Box<dyn TableLoader>,
}

impl DeferredUpdate {
    /// Key cells followed by the deferred cells, for rows that have any
    /// deferred value to set.
    fn update_rows(&self, rows: &[Row]) -> Vec<Row> {
        rows.iter()
            .filter(|row| {
                self.values
                    .iter()
                    .any(|&i| row.get(i).is_some_and(|cell| !cell.is_null()))
            })
            .map(|row| {
                self.keys
                    .iter()
                    .chain(self.values.iter())
                    .map(|&i| row.get(i).cloned().unwrap_or(CellValue::Null))
                    .collect()
            })
            .collect()
    }
}

async fn abandon(loader: Box<dyn TableLoader>, table: &str) {
    if let Err(error) = loader.rollback().await {
        tracing::warn!("Rollback of table '{}' failed: {}", table, error);
    }
}

/// Restores catalogued backups.
pub struct RestoreManager {
    catalog: Arc<dyn Catalog>,
}

impl RestoreManager {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    async fn open(&self, id: Uuid) -> Result<(crate::catalog::BackupRecord, ArtifactReader)> {
        let record = self
            .catalog
            .get(id)
            .await?
            .ok_or_else(|| DbVaultError::not_found(format!("backup {}", id)))?;
        let reader = ArtifactReader::open(completed_artifact(&record)?)?;
        Ok((record, reader))
    }

    /// Restores backup `id` into the database behind `adapter`.
    ///
    /// # Errors
    /// - `NotFound` for an unknown backup
    /// - `ChecksumMismatch` when the artifact changed since it was written
    /// - `Encryption` for a missing or wrong key
    /// - `UnsupportedFeature` for a backup of another engine
    /// - `Configuration` when the target tables do not fit the options
    ///
    /// all of them before anything is written, and `PartialRestore` when
    /// some tables failed after that.
    pub async fn restore(
        &self,
        id: Uuid,
        adapter: &dyn DatabaseAdapter,
        options: &RestoreOptions,
        key: Option<&EncryptionKey>,
    ) -> Result<RestoreReport> {
        options.validate()?;
        let (record, reader) = self.open(id).await?;

        let actual = reader.body_checksum()?;
        if actual != reader.footer_checksum() {
            return Err(DbVaultError::ChecksumMismatch {
                expected: reader.footer_checksum().to_string(),
                actual,
            });
        }
        if record.checksum.as_deref() != Some(actual.as_str()) {
            return Err(DbVaultError::ChecksumMismatch {
                expected: record.checksum.clone().unwrap_or_default(),
                actual,
            });
        }

        let mut frames = reader.frames(key)?;
        let header = reader.header();
        if header.engine != adapter.database_type() {
            return Err(DbVaultError::unsupported_feature(
                format!("restoring a {} backup", header.engine),
                adapter.database_type().to_string(),
            ));
        }

        let plan = read_plan(&mut frames)?;
        let selected: Vec<String> = plan
            .order
            .iter()
            .filter(|name| options.filter.matches(name))
            .cloned()
            .collect();

        let mut definitions: BTreeMap<String, TableMetadata> = BTreeMap::new();
        let mut pending = None;
        while let Some(frame) = frames.next_frame()? {
            match frame {
                Frame::Table { table } => {
                    definitions.insert(table.name.clone(), table);
                }
                other => {
                    pending = Some(other);
                    break;
                }
            }
        }

        let create_schema = options.schema && header.mode.includes_schema();
        let load_data = options.data && header.mode.includes_data();
        if !create_schema && !load_data {
            return Err(DbVaultError::configuration(format!(
                "a {} backup has nothing to restore with the selected options",
                header.mode
            )));
        }

        let existing: BTreeSet<String> = adapter.list_tables().await?.into_iter().collect();
        if create_schema {
            let clashing: Vec<&str> = selected
                .iter()
                .filter(|name| existing.contains(*name))
                .map(String::as_str)
                .collect();
            if !clashing.is_empty() {
                return Err(DbVaultError::configuration(format!(
                    "target already contains tables: {}",
                    clashing.join(", ")
                )));
            }

            let chosen: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
            let orphaned: Vec<String> = selected
                .iter()
                .filter_map(|name| definitions.get(name))
                .flat_map(|table| &table.foreign_keys)
                .filter(|edge| !edge.is_self_reference())
                .filter(|edge| {
                    !chosen.contains(edge.parent_table.as_str())
                        && !existing.contains(&edge.parent_table)
                })
                .map(RelationshipEdge::describe)
                .collect();
            if !orphaned.is_empty() {
                return Err(DbVaultError::configuration(format!(
                    "selected tables reference parents that are neither selected nor present in the target: {}",
                    orphaned.join(", ")
                )));
            }
        } else {
            let missing: Vec<&str> = selected
                .iter()
                .filter(|name| !existing.contains(*name))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(DbVaultError::configuration(format!(
                    "data-only restore requires existing tables: {}",
                    missing.join(", ")
                )));
            }
            // Load into the target's own definitions
            let target = adapter.introspect().await?;
            for name in &selected {
                if let Some(table) = target.table(name) {
                    definitions.insert(name.clone(), table.clone());
                }
            }
        }

        tracing::info!(
            "Restoring {} of {} tables from backup {}",
            selected.len(),
            plan.order.len(),
            id
        );
        let mut report = RestoreReport::new(id);
        let dialect = adapter.dialect();

        if create_schema {
            let mut statements = Vec::new();
            for name in &selected {
                let table = definitions.get(name).ok_or_else(|| {
                    DbVaultError::configuration(format!(
                        "artifact has no definition for table '{}'",
                        name
                    ))
                })?;
                statements.extend(dialect.table_statements(table, &plan.broken_edges));
            }
            adapter.execute_ddl(&statements).await?;
            tracing::debug!("Created {} tables", selected.len());
        }

        if load_data {
            self.load_tables(
                adapter,
                &mut frames,
                pending,
                &selected,
                &definitions,
                &plan.deferred_columns,
                &mut report,
            )
            .await;
            for name in &selected {
                if !report.is_settled(name) {
                    report.fail(name, "artifact holds no complete data for this table");
                }
            }
            self.apply_deferred(&reader, key, adapter, &definitions, &plan, &mut report)
                .await;
        } else {
            report.succeeded = selected.clone();
        }

        if create_schema {
            let restored: BTreeSet<&str> = report.succeeded.iter().map(String::as_str).collect();
            let edges: Vec<RelationshipEdge> = plan
                .broken_edges
                .iter()
                .filter(|edge| {
                    restored.contains(edge.child_table.as_str())
                        && restored.contains(edge.parent_table.as_str())
                })
                .cloned()
                .collect();
            let statements = dialect.deferred_constraints(&edges);
            if !statements.is_empty()
                && let Err(error) = adapter.execute_ddl(&statements).await
            {
                for edge in &edges {
                    report.demote(
                        &edge.child_table,
                        format!("adding deferred foreign key failed: {}", error),
                    );
                }
            }
        }

        tracing::info!(
            "Restore of backup {}: {} tables restored, {} failed, {} rows",
            id,
            report.succeeded.len(),
            report.failed.len(),
            report.rows_restored
        );
        if report.is_complete() {
            Ok(report)
        } else {
            Err(DbVaultError::PartialRestore(Box::new(report)))
        }
    }

    /// Data phase: one transaction per table, failures recorded in `report`.
    #[allow(clippy::too_many_arguments)]
    async fn load_tables(
        &self,
        adapter: &dyn DatabaseAdapter,
        frames: &mut FrameReader,
        mut pending: Option<Frame>,
        selected: &[String],
        definitions: &BTreeMap<String, TableMetadata>,
        deferred: &BTreeMap<String, Vec<String>>,
        report: &mut RestoreReport,
    ) {
        let mut active: Option<ActiveLoad> = None;

        loop {
            let frame = match pending.take() {
                Some(frame) => frame,
                None => match frames.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(error) => {
                        if let Some(load) = active.take() {
                            abandon(load.loader, &load.table).await;
                            report.fail(&load.table, format!("artifact read failed: {}", error));
                        }
                        tracing::error!("Stopping data phase: {}", error);
                        break;
                    }
                },
            };

            match frame {
                Frame::Begin { table, columns, .. } => {
                    if let Some(load) = active.take() {
                        abandon(load.loader, &load.table).await;
                        report.fail(&load.table, "table data was not terminated");
                    }
                    if !selected.contains(&table) {
                        continue;
                    }
                    let Some(metadata) = definitions.get(&table) else {
                        report.fail(&table, "no table definition available");
                        continue;
                    };
                    match adapter.begin_load(metadata).await {
                        Ok(loader) => {
                            let nulled = deferred
                                .get(&table)
                                .map(|names| positions(&columns, names))
                                .unwrap_or_default();
                            tracing::debug!("Loading table '{}'", table);
                            active = Some(ActiveLoad {
                                table,
                                columns,
                                nulled,
                                loader,
                                rows: 0,
                            });
                        }
                        Err(error) => report.fail(&table, error.to_string()),
                    }
                }
                Frame::Rows { table, mut rows } => {
                    let Some(mut load) = active.take() else {
                        continue;
                    };
                    if load.table != table {
                        active = Some(load);
                        continue;
                    }
                    for row in &mut rows {
                        for &index in &load.nulled {
                            if let Some(cell) = row.get_mut(index) {
                                *cell = CellValue::Null;
                            }
                        }
                    }
                    match load.loader.insert_rows(&load.columns, &rows).await {
                        Ok(()) => {
                            load.rows = load.rows.saturating_add(rows.len() as u64);
                            active = Some(load);
                        }
                        Err(error) => {
                            abandon(load.loader, &load.table).await;
                            report.fail(&load.table, error.to_string());
                        }
                    }
                }
                Frame::End { table, row_count } => {
                    let Some(load) = active.take() else {
                        continue;
                    };
                    if load.table != table {
                        active = Some(load);
                        continue;
                    }
                    if load.rows != row_count {
                        abandon(load.loader, &load.table).await;
                        report.fail(
                            &load.table,
                            format!(
                                "row count mismatch: artifact announced {}, loaded {}",
                                row_count, load.rows
                            ),
                        );
                        continue;
                    }
                    match load.loader.commit().await {
                        Ok(()) => {
                            tracing::debug!("Restored {} rows into '{}'", load.rows, load.table);
                            report.rows_restored = report.rows_restored.saturating_add(load.rows);
                            report.succeeded.push(load.table);
                        }
                        Err(error) => report.fail(&load.table, error.to_string()),
                    }
                }
                Frame::Complete { .. } => break,
                Frame::Plan { .. } | Frame::Table { .. } => {
                    tracing::warn!("Ignoring out-of-place frame in the data section");
                }
            }
        }

        if let Some(load) = active.take() {
            abandon(load.loader, &load.table).await;
            report.fail(&load.table, "artifact ended inside the table's data");
        }
    }

    /// Deferred pass: fills columns that were loaded as NULL.
    async fn apply_deferred(
        &self,
        reader: &ArtifactReader,
        key: Option<&EncryptionKey>,
        adapter: &dyn DatabaseAdapter,
        definitions: &BTreeMap<String, TableMetadata>,
        plan: &Plan,
        report: &mut RestoreReport,
    ) {
        let pending: Vec<&String> = plan
            .deferred_columns
            .iter()
            .filter(|(table, columns)| {
                !columns.is_empty() && report.succeeded.iter().any(|name| name == *table)
            })
            .map(|(table, _)| table)
            .collect();
        if pending.is_empty() {
            return;
        }
        tracing::debug!("Applying deferred columns for {} table(s)", pending.len());

        let mut frames = match reader.frames(key) {
            Ok(frames) => frames,
            Err(error) => {
                for table in pending {
                    report.demote(table, format!("deferred pass could not start: {}", error));
                }
                return;
            }
        };

        let mut active: Option<DeferredUpdate> = None;
        let mut done: BTreeSet<String> = BTreeSet::new();
        loop {
            let frame = match frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    if let Some(update) = active.take() {
                        abandon(update.loader, &update.table).await;
                        report.demote(&update.table, format!("artifact read failed: {}", error));
                    }
                    break;
                }
            };

            match frame {
                Frame::Begin {
                    table,
                    columns,
                    primary_key,
                } => {
                    if !pending.contains(&&table) {
                        continue;
                    }
                    let (Some(metadata), Some(set_columns)) =
                        (definitions.get(&table), plan.deferred_columns.get(&table))
                    else {
                        continue;
                    };
                    let key_columns = if primary_key.is_empty() {
                        metadata.primary_key.clone()
                    } else {
                        primary_key
                    };
                    let keys = positions(&columns, &key_columns);
                    let values = positions(&columns, set_columns);
                    if keys.len() != key_columns.len() || key_columns.is_empty() {
                        report.demote(&table, "deferred columns need a primary key");
                        continue;
                    }
                    match adapter.begin_load(metadata).await {
                        Ok(loader) => {
                            active = Some(DeferredUpdate {
                                table,
                                keys,
                                values,
                                key_columns,
                                set_columns: set_columns.clone(),
                                loader,
                            });
                        }
                        Err(error) => report.demote(&table, error.to_string()),
                    }
                }
                Frame::Rows { table, rows } => {
                    let Some(mut update) = active.take() else {
                        continue;
                    };
                    if update.table != table {
                        active = Some(update);
                        continue;
                    }
                    let updates = update.update_rows(&rows);
                    if updates.is_empty() {
                        active = Some(update);
                        continue;
                    }
                    let result = update
                        .loader
                        .update_rows(&update.key_columns, &update.set_columns, &updates)
                        .await;
                    match result {
                        Ok(()) => active = Some(update),
                        Err(error) => {
                            abandon(update.loader, &update.table).await;
                            report.demote(
                                &update.table,
                                format!("deferred update failed: {}", error),
                            );
                        }
                    }
                }
                Frame::End { table, .. } => {
                    let Some(update) = active.take() else {
                        continue;
                    };
                    if update.table != table {
                        active = Some(update);
                        continue;
                    }
                    match update.loader.commit().await {
                        Ok(()) => {
                            done.insert(update.table);
                        }
                        Err(error) => report.demote(
                            &update.table,
                            format!("deferred update failed: {}", error),
                        ),
                    }
                }
                Frame::Complete { .. } => break,
                Frame::Plan { .. } | Frame::Table { .. } => {}
            }
        }

        if let Some(update) = active.take() {
            abandon(update.loader, &update.table).await;
            report.demote(&update.table, "artifact ended inside the deferred pass");
        }
        for table in pending {
            if !done.contains(table) && report.succeeded.contains(table) {
                report.demote(table, "deferred columns were not applied");
            }
        }
    }

    /// Reads the artifact of backup `id` and reports what a restore would
    /// do, without touching any database.
    ///
    /// # Errors
    /// Returns `NotFound`, `Io`, or `Encryption` for a missing or wrong key.
    pub async fn preview(&self, id: Uuid, key: Option<&EncryptionKey>) -> Result<RestorePreview> {
        let (record, reader) = self.open(id).await?;
        let mut frames = reader.frames(key)?;
        let plan = read_plan(&mut frames)?;

        let mut defined = BTreeSet::new();
        let mut rows: BTreeMap<String, u64> = BTreeMap::new();
        while let Some(frame) = frames.next_frame()? {
            match frame {
                Frame::Table { table } => {
                    defined.insert(table.name);
                }
                Frame::End { table, row_count } => {
                    rows.insert(table, row_count);
                }
                Frame::Complete { .. } => break,
                _ => {}
            }
        }

        let header = reader.header();
        let tables: Vec<PreviewTable> = plan
            .order
            .iter()
            .map(|name| PreviewTable {
                name: name.clone(),
                has_definition: defined.contains(name),
                rows: rows.get(name).copied().unwrap_or(0),
            })
            .collect();
        Ok(RestorePreview {
            backup_id: record.id,
            name: record.name,
            mode: header.mode,
            engine: header.engine,
            cipher: header.encryption.as_ref().map(|params| params.cipher),
            total_rows: tables.iter().map(|table| table.rows).sum(),
            tables,
            broken_edges: plan.broken_edges,
            deferred_columns: plan.deferred_columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        assert!(RestoreOptions::default().validate().is_ok());
        assert!(RestoreOptions::default().schema_only().validate().is_ok());
        let nothing = RestoreOptions {
            schema: false,
            data: false,
            ..Default::default()
        };
        assert!(nothing.validate().is_err());
    }

    #[test]
    fn test_report_demote_moves_table() {
        let mut report = RestoreReport::new(Uuid::nil());
        report.succeeded = vec!["a".to_string(), "b".to_string()];
        report.demote("a", "late failure");

        assert_eq!(report.succeeded, vec!["b"]);
        assert_eq!(report.failed[0].table, "a");
        assert!(report.is_settled("a"));
        assert!(!report.is_settled("c"));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_deferred_update_rows_skip_null_values() {
        struct NoopLoader;

        #[async_trait::async_trait]
        impl TableLoader for NoopLoader {
            async fn insert_rows(&mut self, _: &[String], _: &[Row]) -> Result<()> {
                Ok(())
            }
            async fn update_rows(&mut self, _: &[String], _: &[String], _: &[Row]) -> Result<()> {
                Ok(())
            }
            async fn commit(self: Box<Self>) -> Result<()> {
                Ok(())
            }
            async fn rollback(self: Box<Self>) -> Result<()> {
                Ok(())
            }
        }

        let update = DeferredUpdate {
            table: "employees".to_string(),
            keys: vec![0],
            values: vec![2],
            key_columns: vec!["id".to_string()],
            set_columns: vec!["manager_id".to_string()],
            loader: Box::new(NoopLoader),
        };
        let rows = vec![
            vec![
                CellValue::Integer(1),
                CellValue::Text("ceo".to_string()),
                CellValue::Null,
            ],
            vec![
                CellValue::Integer(2),
                CellValue::Text("cto".to_string()),
                CellValue::Integer(1),
            ],
        ];

        assert_eq!(
            update.update_rows(&rows),
            vec![vec![CellValue::Integer(2), CellValue::Integer(1)]]
        );
    }
}
