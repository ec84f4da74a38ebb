//! Log output for the `dbvault` binary and for applications embedding the
//! backup engine.
//!
//! Verbosity comes from `-v`/`-q`; a `RUST_LOG` directive, when present,
//! replaces it entirely. Logs always go to stderr so that `--json` output on
//! stdout stays machine-readable.

use crate::Result;
use crate::error::DbVaultError;
use tracing_subscriber::EnvFilter;

/// Line format of log records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Text,
    /// One JSON object per record, for scheduled jobs shipping logs elsewhere
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = DbVaultError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(DbVaultError::configuration(format!(
                "unknown log format '{}', expected text or json",
                other
            ))),
        }
    }
}

/// Level selected by the CLI flags. `quiet` wins over any `-v` count.
pub fn level_for(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

fn filter_for(verbose: u8, quiet: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbose, quiet).as_str().to_ascii_lowercase()))
}

/// Installs the global subscriber.
///
/// # Errors
/// Returns `Configuration` when a subscriber is already installed.
///
/// ```rust,no_run
/// use dbvault_core::logging::{LogFormat, init_logging};
///
/// init_logging(1, false, LogFormat::Json).expect("logging already set up");
/// ```
pub fn init_logging(verbose: u8, quiet: bool, format: LogFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbose, quiet))
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    installed.map_err(|e| DbVaultError::configuration(format!("Failed to initialize logging: {}", e)))
}
