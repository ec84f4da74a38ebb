//! Backup strategies: how table definitions and rows flow into an artifact.
//!
//! Every mode runs the same pipeline (snapshot, dependency order, header,
//! plan frame) and differs only in what it writes afterwards:
//!
//! | Mode        | Table frames | Row frames | Fetch                      |
//! |-------------|--------------|------------|----------------------------|
//! | `Schema`    | yes          | no         | none                       |
//! | `Data`      | no           | yes        | `chunk_size` windows       |
//! | `Full`      | yes          | yes        | one query per table        |
//! | `Streaming` | yes          | yes        | `chunk_size` windows       |
//!
//! Windows page by primary key where the table has one and by offset
//! otherwise. Windowed fetches keep at most one chunk of rows in memory. Every frame is
//! moved to the file as soon as it is encoded, and transient fetch or write
//! failures are retried under the job's [`crate::config::RetryPolicy`].
//! Cancellation is checked before each table and each chunk.

use crate::Result;
use crate::adapters::{DatabaseAdapter, RowWindow};
use crate::analyzer::SchemaAnalyzer;
use crate::artifact::{ArtifactHeader, ArtifactWriter, FORMAT_VERSION, Frame};
use crate::config::{BackupMode, BackupStrategyConfig};
use crate::error::DbVaultError;
use crate::models::{Row, TableMetadata};
use crate::resolver::DependencyResolver;
use crate::retry::retry_transient;
use crate::storage::{EncryptionKey, EncryptionParams};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How row data is read from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Whole,
    Windowed,
}

impl Fetch {
    fn for_mode(mode: BackupMode) -> Option<Self> {
        match mode {
            BackupMode::Schema => None,
            BackupMode::Full => Some(Self::Whole),
            BackupMode::Data | BackupMode::Streaming => Some(Self::Windowed),
        }
    }
}

/// What a finished backup produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the artifact body
    pub checksum: String,
    pub table_count: u64,
    pub row_count: u64,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(DbVaultError::Cancelled);
    }
    Ok(())
}

/// Runs one backup into a new artifact at `path`.
///
/// The configuration must already be validated. On error the partially
/// written file is left where it is for inspection; only a
/// returned outcome describes a complete artifact.
///
/// # Errors
/// Returns `Cancelled` when `cancel` fires, `ChunkIo` when a fetch or an
/// artifact write keeps failing, and any introspection, ordering or storage error.
pub async fn run_backup(
    adapter: &dyn DatabaseAdapter,
    config: &BackupStrategyConfig,
    key: Option<&EncryptionKey>,
    cancel: &CancellationToken,
    path: &Path,
    backup_id: Uuid,
) -> Result<BackupOutcome> {
    check_cancelled(cancel)?;

    let snapshot = SchemaAnalyzer::new(adapter)
        .analyze_filtered(&config.filter)
        .await?;
    let order = DependencyResolver::resolve(&snapshot)?;
    for edge in &order.broken_edges {
        tracing::info!("Deferring foreign key {} to break a cycle", edge.describe());
    }

    let encryption = match (&config.encryption, key) {
        (Some(spec), Some(key)) => Some(EncryptionParams::generate(spec.cipher, key)?),
        (Some(spec), None) => {
            return Err(DbVaultError::encryption(format!(
                "{} requested but no key supplied",
                spec.cipher
            )));
        }
        (None, _) => None,
    };
    let header = ArtifactHeader {
        format_version: FORMAT_VERSION,
        backup_id,
        name: config.name.clone(),
        mode: config.mode,
        engine: snapshot.engine,
        compression: config.compression.kind,
        key_id: config.encryption.as_ref().map(|spec| spec.key_id.clone()),
        encryption,
        created_at: chrono::Utc::now(),
    };

    let mut writer = ArtifactWriter::create(
        path,
        &header,
        &config.compression,
        header.encryption.as_ref().zip(key),
    )?;
    let plan = Frame::Plan {
        order: order.tables.clone(),
        broken_edges: order.broken_edges.clone(),
        deferred_columns: order.deferred_columns().clone(),
    };
    emit(&mut writer, &plan, &config.name, config, cancel).await?;

    if config.mode.includes_schema() {
        for name in &order.tables {
            if let Some(table) = snapshot.table(name) {
                let frame = Frame::Table {
                    table: table.clone(),
                };
                emit(&mut writer, &frame, name, config, cancel).await?;
            }
        }
    }

    let mut row_count: u64 = 0;
    if let Some(fetch) = Fetch::for_mode(config.mode) {
        for name in &order.tables {
            check_cancelled(cancel)?;
            let Some(table) = snapshot.table(name) else {
                continue;
            };
            let rows =
                backup_table(adapter, config, cancel, &mut writer, table, fetch).await?;
            row_count = row_count.saturating_add(rows);
        }
    }

    let table_count = order.tables.len() as u64;
    writer.write_frame(&Frame::Complete {
        tables: table_count,
        rows: row_count,
    })?;
    writer.seal()?;
    flush_artifact(&mut writer, &config.name, config, cancel).await?;
    let summary = writer.finish()?;

    tracing::info!(
        "Backup '{}' wrote {} tables, {} rows, {} bytes",
        config.name,
        table_count,
        row_count,
        summary.size_bytes
    );
    Ok(BackupOutcome {
        path: summary.path,
        size_bytes: summary.size_bytes,
        checksum: summary.checksum,
        table_count,
        row_count,
    })
}

async fn backup_table(
    adapter: &dyn DatabaseAdapter,
    config: &BackupStrategyConfig,
    cancel: &CancellationToken,
    writer: &mut ArtifactWriter,
    table: &TableMetadata,
    fetch: Fetch,
) -> Result<u64> {
    let begin = Frame::Begin {
        table: table.name.clone(),
        columns: table.column_names(),
        primary_key: table.primary_key.clone(),
    };
    emit(writer, &begin, &table.name, config, cancel).await?;

    let chunk_size = config.chunk_size.max(1);
    let mut written: u64 = 0;
    match fetch {
        Fetch::Whole => {
            let rows = retry_transient(&config.retry, &table.name, cancel, move || {
                adapter.fetch_rows(table, RowWindow::all())
            })
            .await?;
            for chunk in rows.chunks(chunk_size) {
                let frame = rows_frame(&table.name, chunk.to_vec());
                emit(writer, &frame, &table.name, config, cancel).await?;
                written = written.saturating_add(chunk.len() as u64);
            }
        }
        Fetch::Windowed => {
            let limit = chunk_size as u64;
            let mut window = RowWindow::chunk(0, limit);
            loop {
                check_cancelled(cancel)?;
                let rows = retry_transient(&config.retry, &table.name, cancel, || {
                    adapter.fetch_rows(table, window.clone())
                })
                .await?;
                let fetched = rows.len() as u64;
                let next = rows
                    .last()
                    .map(|last| RowWindow::following(table, last, written.saturating_add(fetched), limit));
                if fetched > 0 {
                    let frame = rows_frame(&table.name, rows);
                    emit(writer, &frame, &table.name, config, cancel).await?;
                    written = written.saturating_add(fetched);
                }
                tracing::trace!("Table '{}': {} rows so far", table.name, written);
                match next {
                    Some(next) if fetched >= limit => window = next,
                    _ => break,
                }
            }
        }
    }

    let end = Frame::End {
        table: table.name.clone(),
        row_count: written,
    };
    emit(writer, &end, &table.name, config, cancel).await?;
    tracing::debug!("Backed up {} rows from '{}'", written, table.name);
    Ok(written)
}

fn rows_frame(table: &str, rows: Vec<Row>) -> Frame {
    Frame::Rows {
        table: table.to_string(),
        rows,
    }
}

/// Encodes `frame` and moves it to the file.
async fn emit(
    writer: &mut ArtifactWriter,
    frame: &Frame,
    scope: &str,
    config: &BackupStrategyConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    writer.write_frame(frame)?;
    flush_artifact(writer, scope, config, cancel).await
}

/// Writes staged artifact bytes, retrying transient file errors.
///
/// A failed flush keeps its unwritten bytes staged, so a retry writes each
/// byte exactly once.
async fn flush_artifact(
    writer: &mut ArtifactWriter,
    scope: &str,
    config: &BackupStrategyConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    retry_transient(&config.retry, scope, cancel, || {
        std::future::ready(writer.flush_staged().map_err(|e| write_error(scope, e)))
    })
    .await
}

/// Maps a failed artifact write to `ChunkIo` (retried) or `Io`.
fn write_error(scope: &str, error: io::Error) -> DbVaultError {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ResourceBusy => {
            DbVaultError::chunk_io(scope, error)
        }
        _ => DbVaultError::io("writing artifact", error),
    }
}
