//! SQLite backup and restore integration tests.
//!
//! This test suite covers:
//! - Full round trips of schema and rows, including cycles and self references
//! - Streaming with different chunk sizes
//! - Schema-only and data-only restores
//! - Partial restores with per-table rollback
//! - Verification and tamper detection
//! - Catalog persistence across reopen
//!
//! Note: sources are in-memory databases, targets are files in a temp dir.

#![cfg(feature = "sqlite")]

use dbvault_core::{
    BackupManager, BackupMode, BackupStatus, BackupStrategyConfig, Catalog, CompressionKind,
    CompressionSpec, DatabaseAdapter, JsonlCatalog, RestoreManager, RestoreOptions, Result,
    RowWindow, SchemaAnalyzer, TableFilter,
    adapters::sqlite::SqliteAdapter,
    artifact::{ArtifactReader, Frame},
    error::DbVaultError,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SHOP_SCHEMA: &[&str] = &[
    "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, balance REAL, avatar BLOB)",
    "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL REFERENCES customers(id), placed_at TEXT)",
    "CREATE TABLE employees (id INTEGER PRIMARY KEY, name TEXT NOT NULL, manager_id INTEGER REFERENCES employees(id))",
    "CREATE TABLE departments (id INTEGER PRIMARY KEY, name TEXT NOT NULL, head_id INTEGER REFERENCES staff(id))",
    "CREATE TABLE staff (id INTEGER PRIMARY KEY, department_id INTEGER NOT NULL REFERENCES departments(id))",
];

const SHOP_ROWS: &[&str] = &[
    "INSERT INTO customers VALUES (1, 'Ada', 10.5, X'0102FF'), (2, 'Grace', NULL, NULL), (3, 'Linus', -3.25, X'00')",
    "INSERT INTO orders VALUES (1, 1, '2024-01-01'), (2, 1, '2024-01-02'), (3, 2, NULL), (4, 3, '2024-02-29')",
    "INSERT INTO employees VALUES (1, 'Root', NULL), (2, 'Mid', NULL), (3, 'Boss', NULL), (4, 'Leaf', 2)",
    "UPDATE employees SET manager_id = 3 WHERE id IN (1, 2)",
    "INSERT INTO departments VALUES (1, 'Engineering', NULL), (2, 'Sales', NULL)",
    "INSERT INTO staff VALUES (10, 1), (11, 1), (12, 2)",
    "UPDATE departments SET head_id = 11 WHERE id = 1",
    "UPDATE departments SET head_id = 12 WHERE id = 2",
];

/// Total rows inserted by `SHOP_ROWS`
const SHOP_ROW_COUNT: u64 = 16;

async fn execute_all(adapter: &SqliteAdapter, statements: &[&str]) {
    for statement in statements {
        sqlx::query(statement)
            .execute(&adapter.pool)
            .await
            .unwrap_or_else(|e| panic!("{statement}: {e}"));
    }
}

async fn shop_source() -> SqliteAdapter {
    let adapter = SqliteAdapter::new("sqlite::memory:").await.unwrap();
    execute_all(&adapter, SHOP_SCHEMA).await;
    execute_all(&adapter, SHOP_ROWS).await;
    adapter
}

async fn file_target(dir: &Path, name: &str) -> SqliteAdapter {
    let url = format!("sqlite://{}", dir.join(name).display());
    SqliteAdapter::new(&url).await.unwrap()
}

async fn count(adapter: &SqliteAdapter, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
        .fetch_one(&adapter.pool)
        .await
        .unwrap()
}

/// Asserts that every table of `source` has identical rows in `target`.
async fn assert_same_rows(source: &SqliteAdapter, target: &SqliteAdapter) {
    let snapshot = SchemaAnalyzer::new(source).analyze().await.unwrap();
    let restored = SchemaAnalyzer::new(target).analyze().await.unwrap();
    assert_eq!(snapshot.table_names(), restored.table_names());

    for table in snapshot.tables() {
        let expected = source.fetch_rows(table, RowWindow::all()).await.unwrap();
        let actual = target.fetch_rows(table, RowWindow::all()).await.unwrap();
        assert_eq!(expected, actual, "rows of '{}' differ", table.name);
    }
}

struct Harness {
    dir: tempfile::TempDir,
    catalog: Arc<dyn Catalog>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = JsonlCatalog::open(&dir.path().join("catalog.jsonl"))
            .await
            .unwrap();
        Self {
            dir,
            catalog: Arc::new(catalog),
        }
    }

    fn config(&self, name: &str) -> BackupStrategyConfig {
        BackupStrategyConfig::new(name, self.dir.path().join("artifacts"))
    }

    fn backups(&self) -> BackupManager {
        BackupManager::new(self.catalog.clone())
    }

    fn restores(&self) -> RestoreManager {
        RestoreManager::new(self.catalog.clone())
    }
}

#[tokio::test]
async fn test_round_trip_restores_schema_and_rows() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let config = harness
        .config("shop")
        .with_compression(CompressionSpec::new(CompressionKind::Gzip));

    let record = harness
        .backups()
        .backup(&source, &config, None, &CancellationToken::new())
        .await?;
    assert_eq!(record.status, BackupStatus::Completed);
    assert_eq!(record.table_count, 5);
    assert_eq!(record.row_count, SHOP_ROW_COUNT);

    let target = file_target(harness.dir.path(), "restored.db").await;
    let report = harness
        .restores()
        .restore(record.id, &target, &RestoreOptions::default(), None)
        .await?;

    assert!(report.is_complete());
    assert_eq!(report.succeeded.len(), 5);
    assert_eq!(report.rows_restored, SHOP_ROW_COUNT);
    assert_same_rows(&source, &target).await;

    // Deferred columns end up with their original values
    let head: Option<i64> = sqlx::query_scalar("SELECT head_id FROM departments WHERE id = 1")
        .fetch_one(&target.pool)
        .await
        .unwrap();
    assert_eq!(head, Some(11));
    let manager: Option<i64> = sqlx::query_scalar("SELECT manager_id FROM employees WHERE id = 1")
        .fetch_one(&target.pool)
        .await
        .unwrap();
    assert_eq!(manager, Some(3));
    Ok(())
}

#[tokio::test]
async fn test_chunk_sizes_do_not_change_restored_rows() -> Result<()> {
    let source = SqliteAdapter::new("sqlite::memory:").await?;
    execute_all(
        &source,
        &[
            "CREATE TABLE readings (id INTEGER PRIMARY KEY, sensor TEXT NOT NULL, value REAL)",
            "INSERT INTO readings (id, sensor, value) \
             WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 250) \
             SELECT n, 'sensor-' || (n % 7), n * 0.5 FROM seq",
        ],
    )
    .await;

    for chunk_size in [1, 100, 10_000] {
        let harness = Harness::new().await;
        let config = harness
            .config("readings")
            .with_chunk_size(chunk_size)
            .with_compression(CompressionSpec::new(CompressionKind::Zstd));
        let record = harness
            .backups()
            .backup(&source, &config, None, &CancellationToken::new())
            .await?;
        assert_eq!(record.row_count, 250, "chunk size {chunk_size}");

        let target = file_target(harness.dir.path(), "restored.db").await;
        harness
            .restores()
            .restore(record.id, &target, &RestoreOptions::default(), None)
            .await?;
        assert_same_rows(&source, &target).await;
    }
    Ok(())
}

async fn streaming_round_trip(rows: u64, chunk_size: usize) -> Result<()> {
    let source = SqliteAdapter::new("sqlite::memory:").await?;
    let fill = format!(
        "INSERT INTO events (id, payload) \
         WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < {rows}) \
         SELECT n, 'event-' || n FROM seq"
    );
    execute_all(
        &source,
        &[
            "CREATE TABLE events (id INTEGER PRIMARY KEY, payload TEXT NOT NULL)",
            fill.as_str(),
        ],
    )
    .await;

    let harness = Harness::new().await;
    let config = harness
        .config("events")
        .with_mode(BackupMode::Streaming)
        .with_chunk_size(chunk_size);
    let record = harness
        .backups()
        .backup(&source, &config, None, &CancellationToken::new())
        .await?;

    // No frame ever holds more than one chunk
    let reader = ArtifactReader::open(record.location.as_deref().unwrap())?;
    let mut frames = reader.frames(None)?;
    let mut chunks = 0u64;
    while let Some(frame) = frames.next_frame()? {
        if let Frame::Rows { rows: chunk, .. } = frame {
            assert!(chunk.len() <= chunk_size);
            chunks += 1;
        }
    }
    assert_eq!(chunks, rows.div_ceil(chunk_size as u64));

    let target = file_target(harness.dir.path(), "restored.db").await;
    let report = harness
        .restores()
        .restore(record.id, &target, &RestoreOptions::default(), None)
        .await?;
    assert_eq!(report.rows_restored, rows);
    assert_eq!(count(&target, "events").await, i64::try_from(rows).unwrap());
    Ok(())
}

#[tokio::test]
async fn test_streaming_backup_restores_every_row() -> Result<()> {
    streaming_round_trip(20_000, 1000).await
}

#[tokio::test]
#[ignore = "slow: one million rows"]
async fn test_streaming_backup_restores_one_million_rows() -> Result<()> {
    streaming_round_trip(1_000_000, 1000).await
}

#[tokio::test]
async fn test_schema_only_then_data_only_restore() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let record = harness
        .backups()
        .backup(&source, &harness.config("shop"), None, &CancellationToken::new())
        .await?;

    let target = file_target(harness.dir.path(), "restored.db").await;
    let restores = harness.restores();
    let schema_report = restores
        .restore(record.id, &target, &RestoreOptions::default().schema_only(), None)
        .await?;
    assert_eq!(schema_report.rows_restored, 0);
    assert_eq!(count(&target, "customers").await, 0);

    // A second schema restore would clash with the tables just created
    let clash = restores
        .restore(record.id, &target, &RestoreOptions::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(clash, DbVaultError::Configuration { .. }));

    let data_report = restores
        .restore(record.id, &target, &RestoreOptions::default().data_only(), None)
        .await?;
    assert_eq!(data_report.rows_restored, SHOP_ROW_COUNT);
    assert_same_rows(&source, &target).await;
    Ok(())
}

#[tokio::test]
async fn test_data_only_requires_existing_tables() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let record = harness
        .backups()
        .backup(&source, &harness.config("shop"), None, &CancellationToken::new())
        .await?;

    let target = file_target(harness.dir.path(), "empty.db").await;
    let error = harness
        .restores()
        .restore(record.id, &target, &RestoreOptions::default().data_only(), None)
        .await
        .unwrap_err();
    assert!(matches!(error, DbVaultError::Configuration { .. }));
    assert!(target.list_tables().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_table_is_rolled_back_and_reported() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let record = harness
        .backups()
        .backup(&source, &harness.config("shop"), None, &CancellationToken::new())
        .await?;

    let target = file_target(harness.dir.path(), "restored.db").await;
    let restores = harness.restores();
    restores
        .restore(record.id, &target, &RestoreOptions::default().schema_only(), None)
        .await?;
    // Conflicts with order 3 of the backup
    execute_all(&target, &["INSERT INTO customers VALUES (2, 'Grace', 1.0, NULL)"]).await;
    execute_all(&target, &["INSERT INTO orders VALUES (3, 2, 'pre-existing')"]).await;

    let error = restores
        .restore(record.id, &target, &RestoreOptions::default().data_only(), None)
        .await
        .unwrap_err();
    let DbVaultError::PartialRestore(report) = error else {
        panic!("expected a partial restore, got {error:?}");
    };

    let failed: Vec<&str> = report.failed.iter().map(|f| f.table.as_str()).collect();
    assert!(failed.contains(&"customers"));
    assert!(failed.contains(&"orders"));
    assert!(report.succeeded.contains(&"employees".to_string()));
    assert!(report.succeeded.contains(&"staff".to_string()));

    // Failed tables keep only what was there before
    assert_eq!(count(&target, "customers").await, 1);
    assert_eq!(count(&target, "orders").await, 1);
    assert_eq!(count(&target, "employees").await, 4);
    Ok(())
}

#[tokio::test]
async fn test_filtered_restore_selects_tables() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let record = harness
        .backups()
        .backup(&source, &harness.config("shop"), None, &CancellationToken::new())
        .await?;

    let target = file_target(harness.dir.path(), "restored.db").await;
    let options =
        RestoreOptions::default().with_filter(TableFilter::default().include("employees"));
    let report = harness
        .restores()
        .restore(record.id, &target, &options, None)
        .await?;

    assert_eq!(report.succeeded, vec!["employees"]);
    assert_eq!(target.list_tables().await?, vec!["employees"]);
    assert_eq!(count(&target, "employees").await, 4);
    Ok(())
}

#[tokio::test]
async fn test_filtered_restore_requires_parents() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let record = harness
        .backups()
        .backup(&source, &harness.config("shop"), None, &CancellationToken::new())
        .await?;

    let target = file_target(harness.dir.path(), "restored.db").await;
    let options = RestoreOptions::default().with_filter(TableFilter::default().include("orders"));
    let error = harness
        .restores()
        .restore(record.id, &target, &options, None)
        .await
        .unwrap_err();

    assert!(matches!(error, DbVaultError::Configuration { .. }), "{error:?}");
    assert!(error.to_string().contains("customers"));
    assert!(target.list_tables().await?.is_empty());

    // Columns deferred to break a cycle still need their parent
    let options =
        RestoreOptions::default().with_filter(TableFilter::default().include("departments"));
    let error = harness
        .restores()
        .restore(record.id, &target, &options, None)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("staff"), "{error}");
    assert!(target.list_tables().await?.is_empty());

    // Selecting the parent as well is enough
    let options = RestoreOptions::default().with_filter(
        TableFilter::default().include("orders").include("customers"),
    );
    let report = harness
        .restores()
        .restore(record.id, &target, &options, None)
        .await?;
    assert_eq!(report.succeeded, vec!["customers", "orders"]);
    Ok(())
}

#[tokio::test]
async fn test_verify_detects_tampering() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let backups = harness.backups();
    let record = backups
        .backup(&source, &harness.config("shop"), None, &CancellationToken::new())
        .await?;

    let first = backups.verify(record.id).await?;
    let second = backups.verify(record.id).await?;
    assert!(first.valid);
    assert_eq!(first, second);
    assert_eq!(first.actual, record.checksum.clone().unwrap());

    // Flip the last body byte, just before the footer
    let path = record.location.clone().unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    let index = bytes.len() - 49;
    bytes[index] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let tampered = backups.verify(record.id).await?;
    assert!(!tampered.valid);
    assert_eq!(tampered.expected, first.expected);
    assert_ne!(tampered.actual, first.actual);

    let target = file_target(harness.dir.path(), "restored.db").await;
    let error = harness
        .restores()
        .restore(record.id, &target, &RestoreOptions::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(error, DbVaultError::ChecksumMismatch { .. }));
    assert!(target.list_tables().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_catalog_survives_reopen() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let config = harness.config("shop").with_tag("nightly");
    let first = harness
        .backups()
        .backup(&source, &config, None, &CancellationToken::new())
        .await?;
    let second = harness
        .backups()
        .backup(
            &source,
            &config.clone().with_mode(BackupMode::Schema),
            None,
            &CancellationToken::new(),
        )
        .await?;

    let reopened = JsonlCatalog::open(&harness.dir.path().join("catalog.jsonl")).await?;
    let records = reopened.list().await?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, second.id);
    assert_eq!(records[1].id, first.id);
    assert_eq!(records[1].status, BackupStatus::Completed);
    assert_eq!(records[1].checksum, first.checksum);
    assert_eq!(records[1].tags, vec!["nightly"]);
    assert_eq!(records[0].row_count, 0);
    Ok(())
}

#[tokio::test]
async fn test_preview_reads_artifact_without_restoring() -> Result<()> {
    let source = shop_source().await;
    let harness = Harness::new().await;
    let record = harness
        .backups()
        .backup(&source, &harness.config("shop"), None, &CancellationToken::new())
        .await?;

    let preview = harness.restores().preview(record.id, None).await?;
    assert_eq!(preview.total_rows, SHOP_ROW_COUNT);
    assert_eq!(preview.tables.len(), 5);
    assert!(preview.tables.iter().all(|table| table.has_definition));
    assert_eq!(preview.broken_edges.len(), 1);
    assert_eq!(
        preview.deferred_columns.get("employees"),
        Some(&vec!["manager_id".to_string()])
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_backup_is_not_found() {
    let harness = Harness::new().await;
    let target = file_target(harness.dir.path(), "restored.db").await;
    let error = harness
        .restores()
        .restore(uuid::Uuid::new_v4(), &target, &RestoreOptions::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(error, DbVaultError::NotFound { .. }));
}
