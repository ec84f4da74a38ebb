//! Job configuration: table filters, backup strategy and retry policy.
//!
//! All configuration structs follow the same pattern: safe defaults,
//! `with_*` builder methods and a `validate()` that runs before any I/O.

use crate::error::DbVaultError;
use crate::storage::{CipherKind, CompressionSpec, EncryptionKey};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of rows per fetch for streaming backups
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// What a backup captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Table definitions only
    Schema,
    /// Row data only; restore expects the tables to exist
    Data,
    /// Definitions and data, one query per table
    Full,
    /// Definitions and data, fetched in bounded chunks
    #[default]
    Streaming,
}

impl BackupMode {
    /// True when the artifact carries table definitions
    pub fn includes_schema(&self) -> bool {
        !matches!(self, Self::Data)
    }

    /// True when the artifact carries row data
    pub fn includes_data(&self) -> bool {
        !matches!(self, Self::Schema)
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Schema => "schema",
            Self::Data => "data",
            Self::Full => "full",
            Self::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for BackupMode {
    type Err = DbVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "schema" | "schema-only" => Ok(Self::Schema),
            "data" | "data-only" => Ok(Self::Data),
            "full" => Ok(Self::Full),
            "streaming" | "stream" => Ok(Self::Streaming),
            other => Err(DbVaultError::configuration(format!(
                "unknown backup mode '{}'",
                other
            ))),
        }
    }
}

/// Include/exclude table selection with `*` and `?` wildcards.
///
/// A table is selected when it matches any include pattern (or no include
/// patterns are given) and matches no exclude pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl TableFilter {
    /// Builder method to add an include pattern.
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    /// Builder method to add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Checks whether `table` is selected.
    pub fn matches(&self, table: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| glob_matches(p, table));
        included && !self.exclude.iter().any(|p| glob_matches(p, table))
    }

    /// True when the filter selects every table
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Validates filter patterns.
    ///
    /// # Errors
    /// Returns `Configuration` for empty patterns.
    pub fn validate(&self) -> crate::Result<()> {
        if self
            .include
            .iter()
            .chain(self.exclude.iter())
            .any(|p| p.trim().is_empty())
        {
            return Err(DbVaultError::configuration(
                "table filter patterns cannot be empty",
            ));
        }
        Ok(())
    }
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    let mut expression = String::with_capacity(pattern.len() + 2);
    expression.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');

    regex::Regex::new(&expression).is_ok_and(|re| re.is_match(name))
}

/// Cipher selection plus the id of the externally held key.
///
/// The key itself is never part of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSpec {
    pub cipher: CipherKind,
    pub key_id: String,
}

impl EncryptionSpec {
    /// Creates an encryption spec
    pub fn new(cipher: CipherKind, key_id: impl Into<String>) -> Self {
        Self {
            cipher,
            key_id: key_id.into(),
        }
    }
}

/// Bounded exponential backoff with jitter for transient chunk failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Validates retry parameters.
    ///
    /// # Errors
    /// Returns `Configuration` if the policy would never run or never back off.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(DbVaultError::configuration(
                "retry max_attempts must be at least 1",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DbVaultError::configuration(
                "retry multiplier must be a finite value >= 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(DbVaultError::configuration(
                "retry initial_delay cannot exceed max_delay",
            ));
        }
        Ok(())
    }

    /// Upper bound of the delay before retry number `retry` (1-based)
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        }
    }
}

/// Everything a backup job needs except the source connection and the key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStrategyConfig {
    /// Human-readable backup name, also used in the artifact file name
    pub name: String,
    pub mode: BackupMode,
    /// Rows per fetch in streaming mode
    pub chunk_size: usize,
    pub filter: TableFilter,
    pub compression: CompressionSpec,
    pub encryption: Option<EncryptionSpec>,
    /// Directory the artifact is written to
    pub output_dir: PathBuf,
    pub tags: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for BackupStrategyConfig {
    fn default() -> Self {
        Self {
            name: "backup".to_string(),
            mode: BackupMode::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            filter: TableFilter::default(),
            compression: CompressionSpec::default(),
            encryption: None,
            output_dir: PathBuf::from("."),
            tags: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BackupStrategyConfig {
    /// Creates a config with safe defaults
    pub fn new(name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    /// Builder method to set the mode.
    pub fn with_mode(mut self, mode: BackupMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method to set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Builder method to set the table filter.
    pub fn with_filter(mut self, filter: TableFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Builder method to set compression.
    pub fn with_compression(mut self, compression: CompressionSpec) -> Self {
        self.compression = compression;
        self
    }

    /// Builder method to enable encryption.
    pub fn with_encryption(mut self, encryption: EncryptionSpec) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Builder method to add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `Configuration` or `Compression` errors for invalid values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(DbVaultError::configuration("backup name cannot be empty"));
        }
        if self
            .name
            .chars()
            .any(|c| std::path::is_separator(c) || c.is_control())
        {
            return Err(DbVaultError::configuration(
                "backup name cannot contain path separators or control characters",
            ));
        }
        if self.chunk_size == 0 {
            return Err(DbVaultError::configuration(
                "chunk_size must be greater than 0",
            ));
        }
        if let Some(encryption) = &self.encryption
            && encryption.key_id.trim().is_empty()
        {
            return Err(DbVaultError::configuration(
                "encryption key_id cannot be empty",
            ));
        }
        self.filter.validate()?;
        self.compression.validate()?;
        self.retry.validate()
    }

    /// Validates the configuration together with the supplied key.
    ///
    /// # Errors
    /// Returns `Encryption` when encryption is configured without a key or
    /// with a key of the wrong length.
    pub fn validate_with_key(&self, key: Option<&EncryptionKey>) -> crate::Result<()> {
        self.validate()?;
        match (&self.encryption, key) {
            (Some(spec), Some(key)) => spec.cipher.validate_key(key),
            (Some(spec), None) => Err(DbVaultError::encryption(format!(
                "{} requested but no key supplied for key id '{}'",
                spec.cipher, spec.key_id
            ))),
            (None, _) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CompressionKind;

    #[test]
    fn test_table_filter_globs() {
        let filter = TableFilter::default()
            .include("user*")
            .include("orders")
            .exclude("*_tmp");

        assert!(filter.matches("users"));
        assert!(filter.matches("user_roles"));
        assert!(filter.matches("orders"));
        assert!(!filter.matches("users_tmp"));
        assert!(!filter.matches("order_items"));
        assert!(TableFilter::default().matches("anything"));
    }

    #[test]
    fn test_table_filter_escapes_regex() {
        let filter = TableFilter::default().include("a.b");
        assert!(filter.matches("a.b"));
        assert!(!filter.matches("axb"));

        let filter = TableFilter::default().include("t?");
        assert!(filter.matches("t1"));
        assert!(!filter.matches("t12"));
    }

    #[test]
    fn test_chunk_size_zero_rejected() {
        let config = BackupStrategyConfig::new("nightly", "/tmp").with_chunk_size(0);
        assert!(matches!(
            config.validate(),
            Err(DbVaultError::Configuration { .. })
        ));
    }

    #[test]
    fn test_invalid_compression_level_rejected() {
        let config = BackupStrategyConfig::new("nightly", "/tmp")
            .with_compression(CompressionSpec::new(CompressionKind::Gzip).with_level(11));
        assert!(matches!(
            config.validate(),
            Err(DbVaultError::Compression { .. })
        ));
    }

    #[test]
    fn test_encryption_requires_matching_key() {
        let config = BackupStrategyConfig::new("nightly", "/tmp")
            .with_encryption(EncryptionSpec::new(CipherKind::Aes256Gcm, "prod-key"));

        assert!(matches!(
            config.validate_with_key(None),
            Err(DbVaultError::Encryption { .. })
        ));
        let short = EncryptionKey::from_bytes(vec![0u8; 16]);
        assert!(matches!(
            config.validate_with_key(Some(&short)),
            Err(DbVaultError::Encryption { .. })
        ));
        let good = EncryptionKey::from_bytes(vec![0u8; 32]);
        assert!(config.validate_with_key(Some(&good)).is_ok());
    }

    #[test]
    fn test_backup_name_rejects_separators() {
        let config = BackupStrategyConfig::new("../escape", "/tmp");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(8), Duration::from_secs(1));
        assert!(policy.validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..policy }.validate().is_err());
    }

    #[test]
    fn test_backup_mode_phases() {
        assert!(BackupMode::Schema.includes_schema());
        assert!(!BackupMode::Schema.includes_data());
        assert!(!BackupMode::Data.includes_schema());
        assert!(BackupMode::Streaming.includes_data());
        assert_eq!("data-only".parse::<BackupMode>().unwrap(), BackupMode::Data);
    }
}
