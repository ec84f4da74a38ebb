//! Backup jobs, verification and planning over a [`Catalog`].

use crate::Result;
use crate::adapters::DatabaseAdapter;
use crate::analyzer::SchemaAnalyzer;
use crate::artifact::ArtifactReader;
use crate::catalog::{BackupRecord, BackupStatus, Catalog};
use crate::config::{BackupMode, BackupStrategyConfig};
use crate::error::DbVaultError;
use crate::models::RelationshipEdge;
use crate::resolver::DependencyResolver;
use crate::storage::{EncryptionKey, describe_layers};
use crate::strategy::run_backup;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Artifact file extension
pub const ARTIFACT_EXTENSION: &str = "dbv";

/// Outcome of re-hashing an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub id: Uuid,
    /// Checksum recorded in the catalog
    pub expected: String,
    /// Checksum recorded in the artifact footer
    pub footer: String,
    /// Checksum of the body as it is on disk now
    pub actual: String,
    pub valid: bool,
}

/// One table of a [`BackupPlan`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTable {
    pub name: String,
    pub columns: usize,
    pub estimated_rows: u64,
}

/// What a backup would do, without doing it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupPlan {
    pub mode: BackupMode,
    /// Tables in creation order
    pub tables: Vec<PlannedTable>,
    pub broken_edges: Vec<RelationshipEdge>,
    /// Artifact location, with `<id>` standing for the backup id
    pub artifact_path: PathBuf,
    /// Storage chain, e.g. `raw -> gzip(6) -> aes-256-gcm`
    pub layers: String,
}

/// Artifact location for a backup
pub fn artifact_path(config: &BackupStrategyConfig, id: &str) -> PathBuf {
    config
        .output_dir
        .join(format!("{}-{}.{}", config.name, id, ARTIFACT_EXTENSION))
}

/// Location of a completed record's artifact.
pub(crate) fn completed_artifact(record: &BackupRecord) -> Result<&Path> {
    if record.status != BackupStatus::Completed {
        return Err(DbVaultError::configuration(format!(
            "backup {} is {}, only completed backups have an artifact",
            record.id, record.status
        )));
    }
    record
        .location
        .as_deref()
        .ok_or_else(|| DbVaultError::not_found(format!("artifact location of backup {}", record.id)))
}

/// Runs backups and keeps the catalog in step with them.
pub struct BackupManager {
    catalog: Arc<dyn Catalog>,
}

impl BackupManager {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Runs one backup job.
    ///
    /// Configuration and key are validated before a record exists. After
    /// that every failure, cancellation included, moves the record to
    /// `Failed` with the error text before the error is returned.
    ///
    /// # Errors
    /// Any validation, introspection, ordering, streaming or storage error.
    pub async fn backup(
        &self,
        adapter: &dyn DatabaseAdapter,
        config: &BackupStrategyConfig,
        key: Option<&EncryptionKey>,
        cancel: &CancellationToken,
    ) -> Result<BackupRecord> {
        config.validate_with_key(key)?;

        let mut record = BackupRecord::new(config);
        self.catalog.insert(&record).await?;
        let path = artifact_path(config, &record.id.to_string());

        match self
            .run_recorded(adapter, config, key, cancel, &path, &mut record)
            .await
        {
            Ok(completed) => {
                tracing::info!(
                    "Backup {} completed: {} ({} bytes)",
                    completed.id,
                    path.display(),
                    completed.size_bytes
                );
                Ok(completed)
            }
            Err(error) => {
                tracing::error!("Backup {} failed: {}", record.id, error);
                record.mark_failed(error.to_string())?;
                if let Err(update_error) = self.catalog.update(&record).await {
                    tracing::warn!(
                        "Could not record failure of backup {}: {}",
                        record.id,
                        update_error
                    );
                }
                Err(error)
            }
        }
    }

    /// Every step between the catalog insert and the `Completed` update.
    ///
    /// `record` stays `Running` until the completed copy is stored, so the
    /// caller can always move it to `Failed`.
    async fn run_recorded(
        &self,
        adapter: &dyn DatabaseAdapter,
        config: &BackupStrategyConfig,
        key: Option<&EncryptionKey>,
        cancel: &CancellationToken,
        path: &Path,
        record: &mut BackupRecord,
    ) -> Result<BackupRecord> {
        record.mark_running()?;
        self.catalog.update(record).await?;
        tracing::info!(
            "Starting {} backup '{}' ({})",
            config.mode,
            config.name,
            record.id
        );

        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| DbVaultError::io(format!("creating {}", config.output_dir.display()), e))?;
        let outcome = run_backup(adapter, config, key, cancel, path, record.id).await?;

        let mut completed = record.clone();
        completed.mark_completed(&outcome)?;
        self.catalog.update(&completed).await?;
        Ok(completed)
    }

    /// Re-hashes the artifact body and compares it with the footer and the
    /// catalog. Read-only, so repeated calls give the same report.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id and `Io` when the artifact
    /// cannot be read. A checksum difference is reported, not raised.
    pub async fn verify(&self, id: Uuid) -> Result<VerifyReport> {
        let record = self.get(id).await?;
        let path = completed_artifact(&record)?;
        let reader = ArtifactReader::open(path)?;
        let actual = reader.body_checksum()?;
        let expected = record.checksum.clone().unwrap_or_default();
        let footer = reader.footer_checksum().to_string();
        let valid = actual == expected && actual == footer;

        if valid {
            tracing::info!("Backup {} verified", id);
        } else {
            tracing::warn!(
                "Backup {} failed verification: catalog {}, footer {}, body {}",
                id,
                expected,
                footer,
                actual
            );
        }
        Ok(VerifyReport {
            id,
            expected,
            footer,
            actual,
            valid,
        })
    }

    /// All records, newest first.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        self.catalog.list().await
    }

    /// A single record.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn get(&self, id: Uuid) -> Result<BackupRecord> {
        self.catalog
            .get(id)
            .await?
            .ok_or_else(|| DbVaultError::not_found(format!("backup {}", id)))
    }

    /// Introspects, filters and orders without touching storage or the
    /// catalog.
    pub async fn preview(
        &self,
        adapter: &dyn DatabaseAdapter,
        config: &BackupStrategyConfig,
    ) -> Result<BackupPlan> {
        config.validate()?;
        let snapshot = SchemaAnalyzer::new(adapter)
            .analyze_filtered(&config.filter)
            .await?;
        let order = DependencyResolver::resolve(&snapshot)?;

        let mut tables = Vec::with_capacity(order.tables.len());
        for name in &order.tables {
            let Some(table) = snapshot.table(name) else {
                continue;
            };
            let estimated_rows = if config.mode.includes_data() {
                adapter.count_rows(table).await?
            } else {
                0
            };
            tables.push(PlannedTable {
                name: name.clone(),
                columns: table.columns.len(),
                estimated_rows,
            });
        }

        Ok(BackupPlan {
            mode: config.mode,
            tables,
            broken_edges: order.broken_edges,
            artifact_path: artifact_path(config, "<id>"),
            layers: describe_layers(
                &config.compression,
                config.encryption.as_ref().map(|spec| spec.cipher),
            ),
        })
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteAdapter;
    use crate::catalog::MemoryCatalog;
    use crate::config::EncryptionSpec;
    use crate::storage::{CipherKind, CompressionKind, CompressionSpec};

    async fn source() -> SqliteAdapter {
        let adapter = SqliteAdapter::new("sqlite::memory:").await.unwrap();
        for statement in [
            "CREATE TABLE teams (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE TABLE players (id INTEGER PRIMARY KEY, team_id INTEGER REFERENCES teams(id))",
            "INSERT INTO teams (id, name) VALUES (1, 'red'), (2, 'blue')",
            "INSERT INTO players (id, team_id) VALUES (1, 1), (2, 2), (3, NULL)",
        ] {
            sqlx::query(statement).execute(&adapter.pool).await.unwrap();
        }
        adapter
    }

    #[tokio::test]
    async fn test_backup_completes_and_verifies() {
        let adapter = source().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Arc::new(MemoryCatalog::new()));
        let config = BackupStrategyConfig::new("league", dir.path())
            .with_compression(CompressionSpec::new(CompressionKind::Zstd))
            .with_tag("test");

        let record = manager
            .backup(&adapter, &config, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.table_count, 2);
        assert_eq!(record.row_count, 5);
        assert_eq!(record.tags, vec!["test"]);
        let location = record.location.clone().unwrap();
        assert!(location.ends_with(format!("league-{}.dbv", record.id)));

        let first = manager.verify(record.id).await.unwrap();
        let second = manager.verify(record.id).await.unwrap();
        assert!(first.valid);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_config_creates_no_record() {
        let adapter = source().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Arc::new(MemoryCatalog::new()));
        let config = BackupStrategyConfig::new("league", dir.path())
            .with_encryption(EncryptionSpec::new(CipherKind::Aes256Gcm, "k1"));

        let short_key = EncryptionKey::from_bytes(vec![1u8; 16]);
        let error = manager
            .backup(&adapter, &config, Some(&short_key), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, DbVaultError::Encryption { .. }));
        assert!(manager.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_backup_is_failed() {
        let adapter = source().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Arc::new(MemoryCatalog::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = manager
            .backup(
                &adapter,
                &BackupStrategyConfig::new("league", dir.path()),
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, DbVaultError::Cancelled));

        let records = manager.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("Cancelled"));
        assert!(records[0].checksum.is_none());
    }

    /// Stores everything except the `Completed` update.
    #[derive(Default)]
    struct RejectCompletion {
        inner: MemoryCatalog,
    }

    #[async_trait::async_trait]
    impl Catalog for RejectCompletion {
        async fn insert(&self, record: &BackupRecord) -> Result<()> {
            self.inner.insert(record).await
        }

        async fn update(&self, record: &BackupRecord) -> Result<()> {
            if record.status == BackupStatus::Completed {
                return Err(DbVaultError::io(
                    "appending to catalog",
                    std::io::Error::other("disk full"),
                ));
            }
            self.inner.update(record).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<BackupRecord>> {
            self.inner.get(id).await
        }

        async fn list(&self) -> Result<Vec<BackupRecord>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_unrecorded_completion_marks_failed() {
        let adapter = source().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Arc::new(RejectCompletion::default()));
        let config = BackupStrategyConfig::new("league", dir.path());

        let error = manager
            .backup(&adapter, &config, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, DbVaultError::Io { .. }), "{error:?}");

        let records = manager.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert!(
            records[0]
                .error
                .as_deref()
                .unwrap()
                .contains("appending to catalog")
        );
        // The artifact stays for inspection but no record points at it
        assert!(records[0].location.is_none());
        assert!(records[0].checksum.is_none());
        assert!(artifact_path(&config, &records[0].id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_preview_counts_rows_without_writing() {
        let adapter = source().await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        let manager = BackupManager::new(Arc::new(MemoryCatalog::new()));
        let config = BackupStrategyConfig::new("league", &output)
            .with_encryption(EncryptionSpec::new(CipherKind::Aes128Cbc, "k1"));

        let plan = manager.preview(&adapter, &config).await.unwrap();
        let names: Vec<_> = plan.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["teams", "players"]);
        assert_eq!(plan.tables[1].estimated_rows, 3);
        assert_eq!(plan.layers, "raw -> aes-128-cbc");
        assert!(!output.exists());
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_unknown_id() {
        let manager = BackupManager::new(Arc::new(MemoryCatalog::new()));
        let error = manager.verify(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(error, DbVaultError::NotFound { .. }));
    }
}
