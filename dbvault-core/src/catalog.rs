//! Backup catalog: the durable list of backup records.
//!
//! [`JsonlCatalog`] is an append-only JSON-lines file. Every insert or
//! update appends the full record; on open the file is replayed and the
//! last line for an id wins. Writes go through the write half of a
//! `tokio::sync::RwLock`, so appends never interleave.

use crate::Result;
use crate::config::{BackupMode, BackupStrategyConfig};
use crate::error::DbVaultError;
use crate::storage::{CipherKind, CompressionKind};
use crate::strategy::BackupOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupStatus {
    /// True for `Completed` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed transitions: Pending → Running → {Completed, Failed}.
    /// Rewriting a record with its current non-terminal status is allowed.
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending | Self::Running)
                | (Self::Running, Self::Running | Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One backup job as recorded in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub name: String,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub size_bytes: u64,
    /// Hex SHA-256 of the artifact body, set on completion
    pub checksum: Option<String>,
    pub location: Option<PathBuf>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason for `Failed` records
    pub error: Option<String>,
    pub table_count: u64,
    pub row_count: u64,
    pub compression: CompressionKind,
    pub cipher: Option<CipherKind>,
    pub key_id: Option<String>,
}

impl BackupRecord {
    /// Creates a `Pending` record for a job described by `config`.
    pub fn new(config: &BackupStrategyConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            mode: config.mode,
            status: BackupStatus::Pending,
            size_bytes: 0,
            checksum: None,
            location: None,
            tags: config.tags.clone(),
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            table_count: 0,
            row_count: 0,
            compression: config.compression.kind,
            cipher: config.encryption.as_ref().map(|spec| spec.cipher),
            key_id: config.encryption.as_ref().map(|spec| spec.key_id.clone()),
        }
    }

    fn transition(&mut self, next: BackupStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DbVaultError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(BackupStatus::Running)
    }

    /// Records the artifact produced by a finished job.
    pub fn mark_completed(&mut self, outcome: &BackupOutcome) -> Result<()> {
        self.transition(BackupStatus::Completed)?;
        self.size_bytes = outcome.size_bytes;
        self.checksum = Some(outcome.checksum.clone());
        self.location = Some(outcome.path.clone());
        self.table_count = outcome.table_count;
        self.row_count = outcome.row_count;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(BackupStatus::Failed)?;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Storage for backup records.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Adds a new record.
    ///
    /// # Errors
    /// Returns `Configuration` when the id already exists.
    async fn insert(&self, record: &BackupRecord) -> Result<()>;

    /// Replaces a record.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id and `InvalidTransition` when the
    /// stored record is terminal or the status change is not allowed.
    async fn update(&self, record: &BackupRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<BackupRecord>>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<BackupRecord>>;
}

fn check_insert(records: &HashMap<Uuid, BackupRecord>, record: &BackupRecord) -> Result<()> {
    if records.contains_key(&record.id) {
        return Err(DbVaultError::configuration(format!(
            "backup {} already exists in the catalog",
            record.id
        )));
    }
    Ok(())
}

fn check_update(records: &HashMap<Uuid, BackupRecord>, record: &BackupRecord) -> Result<()> {
    let stored = records
        .get(&record.id)
        .ok_or_else(|| DbVaultError::not_found(format!("backup {}", record.id)))?;
    if stored.status.is_terminal() || !stored.status.can_transition_to(record.status) {
        return Err(DbVaultError::InvalidTransition {
            id: record.id.to_string(),
            from: stored.status.to_string(),
            to: record.status.to_string(),
        });
    }
    Ok(())
}

fn newest_first(records: &HashMap<Uuid, BackupRecord>) -> Vec<BackupRecord> {
    let mut list: Vec<BackupRecord> = records.values().cloned().collect();
    list.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    list
}

/// In-process catalog for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: RwLock<HashMap<Uuid, BackupRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn insert(&self, record: &BackupRecord) -> Result<()> {
        let mut records = self.records.write().await;
        check_insert(&records, record)?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, record: &BackupRecord) -> Result<()> {
        let mut records = self.records.write().await;
        check_update(&records, record)?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<BackupRecord>> {
        Ok(newest_first(&*self.records.read().await))
    }
}

/// Append-only JSON-lines catalog file
#[derive(Debug)]
pub struct JsonlCatalog {
    path: PathBuf,
    records: RwLock<HashMap<Uuid, BackupRecord>>,
}

impl JsonlCatalog {
    /// Opens (or creates) the catalog at `path` and replays it.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read and `Serialization` for a
    /// malformed line.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records = HashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (index, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record: BackupRecord = serde_json::from_str(line).map_err(|e| {
                        DbVaultError::serialization(
                            format!("catalog {} line {}", path.display(), index + 1),
                            e,
                        )
                    })?;
                    records.insert(record.id, record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        DbVaultError::io(format!("creating {}", parent.display()), e)
                    })?;
                }
            }
            Err(e) => {
                return Err(DbVaultError::io(
                    format!("reading catalog {}", path.display()),
                    e,
                ));
            }
        }

        tracing::debug!(
            "Loaded {} backup record(s) from {}",
            records.len(),
            path.display()
        );
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &BackupRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| DbVaultError::serialization("encoding backup record", e))?;
        line.push(b'\n');

        let context = || format!("appending to catalog {}", self.path.display());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| DbVaultError::io(context(), e))?;
        file.write_all(&line)
            .await
            .map_err(|e| DbVaultError::io(context(), e))?;
        file.sync_data()
            .await
            .map_err(|e| DbVaultError::io(context(), e))
    }
}

#[async_trait]
impl Catalog for JsonlCatalog {
    async fn insert(&self, record: &BackupRecord) -> Result<()> {
        let mut records = self.records.write().await;
        check_insert(&records, record)?;
        self.append(record).await?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, record: &BackupRecord) -> Result<()> {
        let mut records = self.records.write().await;
        check_update(&records, record)?;
        self.append(record).await?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<BackupRecord>> {
        Ok(newest_first(&*self.records.read().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> BackupRecord {
        BackupRecord::new(&BackupStrategyConfig::new(name, "/tmp"))
    }

    fn outcome() -> BackupOutcome {
        BackupOutcome {
            path: PathBuf::from("/tmp/a.dbv"),
            size_bytes: 128,
            checksum: "ab".repeat(32),
            table_count: 2,
            row_count: 10,
        }
    }

    #[test]
    fn test_status_transitions() {
        use BackupStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = record("nightly");
        assert!(record.mark_completed(&outcome()).is_err());

        record.mark_running().unwrap();
        record.mark_completed(&outcome()).unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.row_count, 10);
        assert!(record.completed_at.is_some());

        let error = record.mark_failed("late").unwrap_err();
        assert!(matches!(error, DbVaultError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_memory_catalog_rules() {
        let catalog = MemoryCatalog::new();
        let mut record = record("nightly");
        catalog.insert(&record).await.unwrap();
        assert!(catalog.insert(&record).await.is_err());

        record.mark_running().unwrap();
        catalog.update(&record).await.unwrap();
        record.mark_failed("boom").unwrap();
        catalog.update(&record).await.unwrap();

        // Terminal records are frozen
        let mut replay = record.clone();
        replay.status = BackupStatus::Running;
        let error = catalog.update(&replay).await.unwrap_err();
        assert!(matches!(error, DbVaultError::InvalidTransition { .. }));

        let unknown = self::record("other");
        assert!(matches!(
            catalog.update(&unknown).await.unwrap_err(),
            DbVaultError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_jsonl_catalog_replays_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("catalog.jsonl");

        let mut first = record("first");
        first.created_at = Utc::now() - chrono::Duration::minutes(5);
        let mut second = record("second");
        {
            let catalog = JsonlCatalog::open(&path).await.unwrap();
            catalog.insert(&first).await.unwrap();
            catalog.insert(&second).await.unwrap();
            first.mark_running().unwrap();
            catalog.update(&first).await.unwrap();
            first.mark_completed(&outcome()).unwrap();
            catalog.update(&first).await.unwrap();
            second.mark_running().unwrap();
            catalog.update(&second).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 5);

        let catalog = JsonlCatalog::open(&path).await.unwrap();
        let listed = catalog.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "second");
        assert_eq!(listed[1].status, BackupStatus::Completed);
        assert_eq!(
            catalog.get(first.id).await.unwrap().unwrap().checksum,
            Some("ab".repeat(32))
        );
        assert!(catalog.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
