//! Migration source generation.
//!
//! Renders `CREATE TABLE` / `CREATE INDEX` statements in dependency order
//! and splits them across files by table count and byte size. Output is a
//! pure function of the snapshot, the order, the options and the timestamp.

use crate::Result;
use crate::ddl::Dialect;
use crate::error::DbVaultError;
use crate::models::{RelationshipEdge, SchemaSnapshot, TableMetadata, UnifiedDataType};
use crate::resolver::DependencyOrder;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Scope used for the trailing file of deferred constraints
const CONSTRAINTS_SCOPE: &str = "schema";

/// File splitting limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Maximum number of tables per file
    pub max_tables_per_file: usize,
    /// Maximum size of a file in bytes; a single larger table still gets
    /// a file of its own
    pub max_bytes_per_file: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            max_tables_per_file: 50,
            max_bytes_per_file: 256 * 1024,
        }
    }
}

impl MigrationOptions {
    /// Builder method to set the table limit.
    pub fn with_max_tables(mut self, max_tables: usize) -> Self {
        self.max_tables_per_file = max_tables;
        self
    }

    /// Builder method to set the byte limit.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes_per_file = max_bytes;
        self
    }

    /// Validates the limits.
    ///
    /// # Errors
    /// Returns `Configuration` when either limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_tables_per_file == 0 {
            return Err(DbVaultError::configuration(
                "max_tables_per_file must be greater than 0",
            ));
        }
        if self.max_bytes_per_file == 0 {
            return Err(DbVaultError::configuration(
                "max_bytes_per_file must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// One generated migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// `{YYYYMMDDHHMMSS}_{seq:04}_{scope}.sql`
    pub file_name: String,
    /// Tables defined in this file, in creation order
    pub tables: Vec<String>,
    pub content: String,
}

/// Generates migration files for one dialect.
#[derive(Debug, Clone)]
pub struct MigrationGenerator {
    dialect: Dialect,
    options: MigrationOptions,
}

impl MigrationGenerator {
    pub fn new(dialect: Dialect, options: MigrationOptions) -> Self {
        Self { dialect, options }
    }

    /// Renders every table of `order` and, when the dialect needs them, a
    /// final file of deferred constraints.
    ///
    /// # Errors
    /// Returns `Configuration` for invalid options or an order that names a
    /// table missing from the snapshot.
    pub fn generate(
        &self,
        snapshot: &SchemaSnapshot,
        order: &DependencyOrder,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<MigrationFile>> {
        self.options.validate()?;
        let stamp = timestamp.format("%Y%m%d%H%M%S").to_string();

        let mut files = Vec::new();
        let mut current: Vec<(String, String)> = Vec::new();
        // Every file starts with its preamble
        let mut current_bytes = self.preamble(1).len();

        for name in &order.tables {
            let table = snapshot.table(name).ok_or_else(|| {
                DbVaultError::configuration(format!(
                    "dependency order names table '{}' which is not in the snapshot",
                    name
                ))
            })?;
            let block = self.table_block(table, &order.broken_edges);

            let full = current.len() >= self.options.max_tables_per_file
                || current_bytes.saturating_add(block.len()) > self.options.max_bytes_per_file;
            if !current.is_empty() && full {
                files.push(self.file(&stamp, files.len(), std::mem::take(&mut current)));
                current_bytes = self.preamble(files.len().saturating_add(1)).len();
            }
            current_bytes = current_bytes.saturating_add(block.len());
            current.push((name.clone(), block));
        }
        if !current.is_empty() {
            files.push(self.file(&stamp, files.len(), current));
        }

        let constraints = self.dialect.deferred_constraints(&order.broken_edges);
        if !constraints.is_empty() {
            let sequence = files.len().saturating_add(1);
            files.push(MigrationFile {
                file_name: format!("{}_{:04}_{}.sql", stamp, sequence, CONSTRAINTS_SCOPE),
                tables: Vec::new(),
                content: format!(
                    "{}-- Foreign keys deferred to break dependency cycles\n{}\n",
                    self.preamble(sequence),
                    constraints.join("\n")
                ),
            });
        }

        tracing::debug!(
            "Generated {} migration file(s) for {} tables",
            files.len(),
            order.tables.len()
        );
        Ok(files)
    }

    fn preamble(&self, sequence: usize) -> String {
        format!(
            "-- Generated by dbvault {}\n-- Dialect: {:?}, file {:04}\n\n",
            env!("CARGO_PKG_VERSION"),
            self.dialect,
            sequence
        )
    }

    fn file(&self, stamp: &str, index: usize, blocks: Vec<(String, String)>) -> MigrationFile {
        let sequence = index.saturating_add(1);
        let scope = blocks
            .first()
            .map(|(name, _)| sanitize_scope(name))
            .unwrap_or_else(|| CONSTRAINTS_SCOPE.to_string());
        let mut content = self.preamble(sequence);
        let mut tables = Vec::with_capacity(blocks.len());
        for (name, block) in blocks {
            content.push_str(&block);
            tables.push(name);
        }
        MigrationFile {
            file_name: format!("{}_{:04}_{}.sql", stamp, sequence, scope),
            tables,
            content,
        }
    }

    fn table_block(&self, table: &TableMetadata, broken: &[RelationshipEdge]) -> String {
        let columns = table
            .columns
            .iter()
            .map(|column| format!("{} {}", column.name, type_label(&column.data_type)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "-- Table: {}\n-- Columns: {}\n{}\n\n",
            table.name,
            columns,
            self.dialect.table_statements(table, broken).join("\n")
        )
    }
}

/// Short label of the unified type, for comments.
fn type_label(data_type: &UnifiedDataType) -> String {
    match data_type {
        UnifiedDataType::String { max_length: Some(n) } => format!("string({})", n),
        UnifiedDataType::String { max_length: None } => "string".to_string(),
        UnifiedDataType::Integer { bits, .. } => format!("int{}", bits),
        UnifiedDataType::Float { .. } => "float".to_string(),
        UnifiedDataType::Decimal { .. } => "decimal".to_string(),
        UnifiedDataType::Boolean => "bool".to_string(),
        UnifiedDataType::DateTime { .. } => "datetime".to_string(),
        UnifiedDataType::Date => "date".to_string(),
        UnifiedDataType::Time { .. } => "time".to_string(),
        UnifiedDataType::Binary { .. } => "binary".to_string(),
        UnifiedDataType::Json => "json".to_string(),
        UnifiedDataType::Uuid => "uuid".to_string(),
        UnifiedDataType::Array { element_type } => format!("{}[]", type_label(element_type)),
        UnifiedDataType::Custom { type_name } => type_name.clone(),
    }
}

fn sanitize_scope(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Writes `files` into `dir`, never replacing an existing file.
///
/// # Errors
/// Returns `Io` if a file already exists or cannot be written. Files
/// written before the failure are left in place.
pub fn write_all(files: &[MigrationFile], dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .map_err(|e| DbVaultError::io(format!("creating {}", dir.display()), e))?;

    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let path = dir.join(&file.file_name);
        let mut handle = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| DbVaultError::io(format!("creating {}", path.display()), e))?;
        handle
            .write_all(file.content.as_bytes())
            .and_then(|()| handle.sync_all())
            .map_err(|e| DbVaultError::io(format!("writing {}", path.display()), e))?;
        tracing::info!("Wrote migration {}", path.display());
        written.push(path);
    }
    Ok(written)
}
