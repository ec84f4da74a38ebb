//! PostgreSQL pool setup.
//!
//! The schema to work in comes from the config, else from a `schema` query
//! parameter on the URL, else `public`. The parameter is stripped before the
//! URL reaches the driver, which would reject it.

use super::{ConnectionConfig, PostgresAdapter};
use crate::Result;
use crate::error::{DbVaultError, redact_database_url};
use url::Url;

/// Schema used when neither the config nor the URL names one
pub const DEFAULT_SCHEMA: &str = "public";

const DEFAULT_PORT: u16 = 5432;

impl PostgresAdapter {
    /// Connects with [`ConnectionConfig::for_restore`] settings.
    ///
    /// # Errors
    /// Returns `Configuration` for a malformed URL and `Connection` when the
    /// server cannot be reached.
    pub async fn new(connection_string: &str) -> Result<Self> {
        Self::with_config(connection_string, ConnectionConfig::for_restore()).await
    }

    pub async fn with_config(connection_string: &str, config: ConnectionConfig) -> Result<Self> {
        let (driver_url, config) = resolve_target(connection_string, config)?;
        let setup = session_setup(&config);

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .test_before_acquire(true)
            .after_connect(move |conn, _meta| {
                let setup = setup.clone();
                Box::pin(async move {
                    use sqlx::Executor;
                    for statement in &setup {
                        conn.execute(statement.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect(&driver_url)
            .await
            .map_err(DbVaultError::connection_failed)?;

        tracing::debug!(
            "Connected to {} as {}",
            redact_database_url(connection_string),
            config
        );
        Ok(Self { pool, config })
    }

    /// Schema this adapter introspects and writes into.
    pub fn schema(&self) -> &str {
        self.config.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Parses the URL, completes `config` from it and returns the URL to hand
/// to the driver.
///
/// # Errors
/// Returns `Configuration` for a URL that is not `postgres://` with a host,
/// or when the completed config does not validate.
pub(crate) fn resolve_target(
    connection_string: &str,
    mut config: ConnectionConfig,
) -> Result<(String, ConnectionConfig)> {
    let mut url = Url::parse(connection_string).map_err(|e| {
        DbVaultError::configuration(format!("Invalid PostgreSQL connection string: {}", e))
    })?;
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(DbVaultError::configuration(
            "PostgreSQL connection strings must use the postgres:// scheme",
        ));
    }
    let Some(host) = url.host_str() else {
        return Err(DbVaultError::configuration(
            "PostgreSQL connection string has no host",
        ));
    };

    config.host = host.to_string();
    config.port = Some(url.port().unwrap_or(DEFAULT_PORT));
    config.database = Some(url.path().trim_start_matches('/'))
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    let (kept, schema): (Vec<_>, Vec<_>) = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .partition(|(key, _)| key != "schema");
    if config.schema.is_none() {
        config.schema = schema.into_iter().map(|(_, value)| value).next_back();
    }
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    config.validate()?;
    Ok((url.to_string(), config))
}

/// Statements run on every new pooled connection.
///
/// Sessions are pinned to UTC so that timestamp text is stable across
/// servers; backup sources additionally refuse writes.
pub(crate) fn session_setup(config: &ConnectionConfig) -> Vec<String> {
    let mut setup = vec![
        format!(
            "SET application_name = 'dbvault-{}'",
            env!("CARGO_PKG_VERSION")
        ),
        "SET timezone = 'UTC'".to_string(),
    ];
    if config.is_read_only() {
        setup.push("SET default_transaction_read_only = on".to_string());
    }
    if let Some(timeout) = config.statement_timeout {
        setup.push(format!("SET statement_timeout = {}", timeout.as_millis()));
    }
    setup
}
