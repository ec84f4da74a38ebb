//! SQLite pool setup.
//!
//! Accepted forms:
//! - `sqlite:///abs/path.db`, `sqlite://rel.db`, `sqlite:rel.db`
//! - bare paths ending in `.db`, `.sqlite` or `.sqlite3`
//! - `sqlite::memory:` or `:memory:`
//!
//! Query parameters on a file URL are ignored; open mode and foreign key
//! enforcement come from the [`ConnectionConfig`].

use super::{ConnectionConfig, SqliteAdapter};
use crate::Result;
use crate::error::DbVaultError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How long a writer waits on a locked database when no statement timeout
/// is configured
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a SQLite connection string points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    Memory,
    File(PathBuf),
}

impl SqliteTarget {
    /// Parses a connection string.
    ///
    /// # Errors
    /// Returns `Configuration` for anything that is neither a SQLite URL, a
    /// SQLite file path nor an in-memory marker.
    pub fn parse(connection_string: &str) -> Result<Self> {
        if connection_string == ":memory:"
            || (connection_string.starts_with("sqlite:")
                && (connection_string.contains(":memory:")
                    || connection_string.contains("mode=memory")))
        {
            return Ok(Self::Memory);
        }

        let path = match connection_string
            .strip_prefix("sqlite://")
            .or_else(|| connection_string.strip_prefix("sqlite:"))
        {
            Some(rest) => rest.split('?').next().unwrap_or(rest),
            None if [".db", ".sqlite", ".sqlite3"]
                .iter()
                .any(|ext| connection_string.ends_with(ext)) =>
            {
                connection_string
            }
            None => {
                return Err(DbVaultError::configuration(
                    "Invalid SQLite connection string: expected a sqlite: URL, a .db/.sqlite file or :memory:",
                ));
            }
        };
        if path.is_empty() {
            return Err(DbVaultError::configuration(
                "SQLite connection string names no file",
            ));
        }
        Ok(Self::File(PathBuf::from(path)))
    }

    /// Name shown in logs and in [`ConnectionConfig::database`]
    pub fn display_name(&self) -> String {
        match self {
            Self::Memory => ":memory:".to_string(),
            Self::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "main".to_string()),
        }
    }

    fn connect_options(&self, config: &ConnectionConfig) -> Result<SqliteConnectOptions> {
        let options = match self {
            Self::Memory => SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                DbVaultError::configuration(format!("Invalid SQLite options: {}", e))
            })?,
            Self::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .read_only(config.is_read_only())
                .create_if_missing(!config.is_read_only()),
        };
        Ok(options
            .foreign_keys(true)
            .busy_timeout(config.statement_timeout.unwrap_or(DEFAULT_BUSY_TIMEOUT)))
    }
}

impl SqliteAdapter {
    /// Opens the database with [`ConnectionConfig::for_restore`] settings,
    /// creating the file if needed.
    ///
    /// # Errors
    /// Returns `Configuration` for a malformed connection string and
    /// `Connection` when the database cannot be opened.
    pub async fn new(connection_string: &str) -> Result<Self> {
        Self::with_config(connection_string, ConnectionConfig::for_restore()).await
    }

    pub async fn with_config(connection_string: &str, mut config: ConnectionConfig) -> Result<Self> {
        let target = SqliteTarget::parse(connection_string)?;
        config.port = None;
        config.database = Some(target.display_name());
        config.validate()?;

        // A memory database lives and dies with its connection
        let in_memory = target == SqliteTarget::Memory;
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .idle_timeout(config.idle_timeout)
        };
        let pool = pool_options
            .acquire_timeout(config.connect_timeout)
            .connect_with(target.connect_options(&config)?)
            .await
            .map_err(DbVaultError::connection_failed)?;

        tracing::debug!("Opened SQLite database {}", config);
        Ok(Self {
            pool,
            config,
            in_memory,
        })
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
