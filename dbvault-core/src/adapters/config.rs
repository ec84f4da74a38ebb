//! Pool and session settings shared by every adapter.
//!
//! Credentials never live here: they stay inside the connection URL, which
//! is only ever logged through [`crate::error::redact_database_url`].

use crate::Result;
use crate::error::DbVaultError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on pooled connections per adapter
pub const MAX_POOL_SIZE: u32 = 64;

/// Whether an adapter may write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Backup sources: sessions are opened read-only where the engine allows
    ReadOnly,
    /// Restore targets
    #[default]
    ReadWrite,
}

/// Settings applied when an adapter opens its pool.
///
/// Host, port and database are filled in by the adapter from the URL and are
/// informational; they are what [`std::fmt::Display`] shows.
///
/// ```rust
/// use dbvault_core::adapters::{AccessMode, ConnectionConfig};
/// use std::time::Duration;
///
/// let config = ConnectionConfig::for_backup()
///     .with_statement_timeout(Duration::from_secs(300));
/// assert_eq!(config.access, AccessMode::ReadOnly);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    /// Schema to back up from or restore into (PostgreSQL)
    pub schema: Option<String>,
    pub access: AccessMode,
    /// How long to wait for a pooled connection
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Per-statement limit; `None` lets large table scans run unbounded
    pub statement_timeout: Option<Duration>,
    pub max_connections: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            database: None,
            schema: None,
            access: AccessMode::default(),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            statement_timeout: None,
            max_connections: 4,
        }
    }
}

impl ConnectionConfig {
    /// Read-only settings for a backup source.
    pub fn for_backup() -> Self {
        Self {
            access: AccessMode::ReadOnly,
            ..Default::default()
        }
    }

    /// Read-write settings for a restore target.
    pub fn for_restore() -> Self {
        Self::default()
    }

    pub fn is_read_only(&self) -> bool {
        self.access == AccessMode::ReadOnly
    }

    /// Builder method to set the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Builder method to set the per-statement timeout.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Builder method to set the pool size.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Checks the settings before any connection is attempted.
    ///
    /// # Errors
    /// Returns `Configuration` for an empty host or schema, a zero port,
    /// a pool size outside `1..=MAX_POOL_SIZE`, or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DbVaultError::configuration("host cannot be empty"));
        }
        if self.port == Some(0) {
            return Err(DbVaultError::configuration("port must be greater than 0"));
        }
        if !(1..=MAX_POOL_SIZE).contains(&self.max_connections) {
            return Err(DbVaultError::configuration(format!(
                "max_connections must be between 1 and {}, got {}",
                MAX_POOL_SIZE, self.max_connections
            )));
        }
        if self.connect_timeout.is_zero() || self.statement_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DbVaultError::configuration("timeouts must be greater than 0"));
        }
        if self.schema.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(DbVaultError::configuration("schema cannot be empty"));
        }
        Ok(())
    }
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(database) = &self.database {
            write!(f, "/{}", database)?;
        }
        if self.is_read_only() {
            f.write_str(" (read-only)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        assert!(ConnectionConfig::for_backup().is_read_only());
        assert!(!ConnectionConfig::for_restore().is_read_only());
    }

    #[test]
    fn test_validation() {
        assert!(ConnectionConfig::default().validate().is_ok());

        let bad = [
            ConnectionConfig {
                host: " ".to_string(),
                ..Default::default()
            },
            ConnectionConfig {
                port: Some(0),
                ..Default::default()
            },
            ConnectionConfig::default().with_max_connections(0),
            ConnectionConfig::default().with_max_connections(MAX_POOL_SIZE + 1),
            ConnectionConfig::default().with_statement_timeout(Duration::ZERO),
            ConnectionConfig::default().with_schema(""),
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_display_has_no_credentials() {
        let config = ConnectionConfig {
            host: "db.internal".to_string(),
            port: Some(5432),
            database: Some("shop".to_string()),
            ..ConnectionConfig::for_backup()
        };
        assert_eq!(config.to_string(), "db.internal:5432/shop (read-only)");
    }
}
