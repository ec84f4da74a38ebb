//! Core engine for DBVault.
//!
//! Introspects relational schemas, orders tables by their foreign-key
//! dependencies, generates migrations and runs streaming backups and
//! restores through a reversible compression and encryption chain.
//!
//! # Security Guarantees
//! - No credentials stored or logged in any data structures
//! - Encryption keys are supplied out of band, held in zeroizing memory and
//!   never written to an artifact or the catalog
//! - AES-CBC / AES-GCM with a fresh random IV per artifact
//! - Every artifact carries a SHA-256 footer that is verified before restore
//!
//! # Architecture
//! - [`adapters`]: engine-specific introspection, row streaming and loading
//! - [`analyzer`] and [`resolver`]: snapshot capture and dependency order
//! - [`migration`]: schema source generation
//! - [`storage`] and [`artifact`]: layered byte streams and the file format
//! - [`manager`] and [`restore`]: backup and restore jobs over a [`catalog`]

pub mod adapters;
pub mod analyzer;
pub mod artifact;
pub mod catalog;
pub mod config;
pub mod ddl;
pub mod error;
pub mod logging;
pub mod manager;
pub mod migration;
pub mod models;
pub mod resolver;
pub mod restore;
pub mod retry;
pub mod storage;
pub mod strategy;

// Re-export commonly used types
pub use adapters::{AccessMode, ConnectionConfig, DatabaseAdapter, RowWindow, TableLoader};
pub use analyzer::SchemaAnalyzer;
pub use catalog::{BackupRecord, BackupStatus, Catalog, JsonlCatalog, MemoryCatalog};
pub use config::{BackupMode, BackupStrategyConfig, EncryptionSpec, RetryPolicy, TableFilter};
pub use error::{DbVaultError, Result};
pub use manager::{BackupManager, BackupPlan, VerifyReport};
pub use migration::{MigrationFile, MigrationGenerator, MigrationOptions};
pub use models::{
    CellValue, ColumnMetadata, DatabaseType, RelationshipEdge, Row, SchemaSnapshot, TableMetadata,
    UnifiedDataType,
};
pub use resolver::{DependencyOrder, DependencyResolver};
pub use restore::{RestoreManager, RestoreOptions, RestorePreview, RestoreReport};
pub use storage::{CipherKind, CompressionKind, CompressionSpec, EncryptionKey};
