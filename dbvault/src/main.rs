//! Database backup, restore and migration generation tool.
//!
//! Every command works against a JSON-lines backup catalog. Source and
//! target databases are given as connection URLs; encryption keys are
//! supplied out of band and never written anywhere.
//!
//! # Security Guarantees
//! - Backups open the source read-only
//! - Connection strings are redacted in logs and errors
//! - Keys are read from a file, an environment variable or a prompt and
//!   held in zeroizing memory

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use dbvault_core::{
    BackupManager, BackupMode, BackupStrategyConfig, Catalog, CipherKind, CompressionKind,
    CompressionSpec, ConnectionConfig, DatabaseAdapter, DbVaultError, DependencyResolver,
    EncryptionKey, EncryptionSpec, JsonlCatalog, MigrationGenerator, MigrationOptions,
    RestoreManager, RestoreOptions, RestoreReport, RetryPolicy, SchemaAnalyzer, TableFilter,
    adapters::create_adapter_with_config, config::DEFAULT_CHUNK_SIZE, error::redact_database_url,
    logging::{LogFormat, init_logging},
    migration::write_all,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "dbvault")]
#[command(about = "Database backup, restore and migration generation")]
#[command(version)]
#[command(long_about = "
DBVault - dependency-aware database backup and restore

Introspects a database, orders its tables by foreign-key dependencies and
streams their contents into a checksummed, optionally compressed and
encrypted artifact. Restores recreate tables parent-first and load each
table in its own transaction.

SUPPORTED DATABASES:
- PostgreSQL (postgres://, ?schema=name selects a schema)
- SQLite (sqlite:// or sqlite:path)

EXAMPLES:
  dbvault backup --database-url sqlite://app.db --name nightly --compression zstd
  dbvault backup --cipher aes-256-gcm --key-file vault.key --database-url postgres://localhost/app
  dbvault verify 5f0c...
  dbvault restore 5f0c... --database-url sqlite://restored.db
  dbvault migrate --database-url sqlite://app.db --out-dir migrations
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a database into a new artifact
    Backup(BackupArgs),
    /// Restore a catalogued backup
    Restore(RestoreArgs),
    /// List catalogued backups, newest first
    List(ListArgs),
    /// Re-hash an artifact and compare it with the catalog
    Verify(VerifyArgs),
    /// Show what a backup would do without running it
    Preview(BackupArgs),
    /// Show what an artifact contains without restoring it
    Inspect(InspectArgs),
    /// Generate migration files from a live schema
    Migrate(MigrateArgs),
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    quiet: bool,

    /// Backup catalog file
    #[arg(
        long,
        global = true,
        env = "DBVAULT_CATALOG",
        default_value = "dbvault-catalog.jsonl"
    )]
    catalog: PathBuf,

    /// Log line format (text or json); RUST_LOG overrides the level flags
    #[arg(long, global = true, env = "DBVAULT_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Tables to include (`*` and `?` wildcards)
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Tables to exclude (`*` and `?` wildcards)
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> TableFilter {
        TableFilter {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

#[derive(Args, Debug, Default)]
struct KeyArgs {
    /// Base64-encoded encryption key
    #[arg(long = "key", env = "DBVAULT_KEY", hide_env_values = true, value_name = "BASE64")]
    key_base64: Option<String>,

    /// File holding the base64-encoded key
    #[arg(long, value_name = "PATH")]
    key_file: Option<PathBuf>,

    /// Prompt for the base64-encoded key
    #[arg(long)]
    prompt_key: bool,
}

impl KeyArgs {
    /// Loads the key. A key file wins over the prompt, the prompt over the
    /// environment.
    fn load(&self) -> anyhow::Result<Option<EncryptionKey>> {
        let encoded = if let Some(path) = &self.key_file {
            Zeroizing::new(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading key file {}", path.display()))?,
            )
        } else if self.prompt_key {
            Zeroizing::new(
                rpassword::prompt_password("Encryption key (base64): ")
                    .context("reading key from terminal")?,
            )
        } else if let Some(encoded) = &self.key_base64 {
            Zeroizing::new(encoded.clone())
        } else {
            return Ok(None);
        };

        let key = EncryptionKey::from_base64(encoded.trim())?;
        Ok(Some(key))
    }
}

#[derive(Args, Debug)]
struct BackupArgs {
    /// Source database connection URL
    #[arg(
        long,
        env = "DATABASE_URL",
        hide_env_values = true,
        help = "Database connection string (credentials will be sanitized in logs)"
    )]
    database_url: String,

    /// Backup name, used in the artifact file name
    #[arg(long, default_value = "backup")]
    name: String,

    /// Directory the artifact is written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// schema, data, full or streaming
    #[arg(long, default_value = "streaming")]
    mode: BackupMode,

    /// Rows per fetch
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[command(flatten)]
    filter: FilterArgs,

    /// none, gzip, bzip2 or zstd
    #[arg(long, default_value = "none")]
    compression: CompressionKind,

    /// Compression level (kind-specific range)
    #[arg(long)]
    compression_level: Option<u32>,

    /// aes-{128,192,256}-{cbc,gcm}
    #[arg(long)]
    cipher: Option<CipherKind>,

    /// Reference id of the key, stored in the catalog
    #[arg(long, default_value = "default")]
    key_id: String,

    /// Tag stored with the backup record (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Attempts per chunk fetch before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    #[command(flatten)]
    key: KeyArgs,
}

impl BackupArgs {
    fn to_config(&self) -> BackupStrategyConfig {
        let mut compression = CompressionSpec::new(self.compression);
        if let Some(level) = self.compression_level {
            compression = compression.with_level(level);
        }

        let mut config = BackupStrategyConfig::new(self.name.clone(), self.output_dir.clone())
            .with_mode(self.mode)
            .with_chunk_size(self.chunk_size)
            .with_filter(self.filter.to_filter())
            .with_compression(compression)
            .with_retry(RetryPolicy {
                max_attempts: self.max_attempts,
                ..Default::default()
            });
        if let Some(cipher) = self.cipher {
            config = config.with_encryption(EncryptionSpec::new(cipher, self.key_id.clone()));
        }
        for tag in &self.tags {
            config = config.with_tag(tag.clone());
        }
        config
    }
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Backup id
    id: Uuid,

    /// Target database connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[command(flatten)]
    filter: FilterArgs,

    /// Only create tables
    #[arg(long, conflicts_with = "data_only")]
    schema_only: bool,

    /// Only load rows into existing tables
    #[arg(long)]
    data_only: bool,

    #[command(flatten)]
    key: KeyArgs,
}

impl RestoreArgs {
    fn to_options(&self) -> RestoreOptions {
        let options = RestoreOptions::default().with_filter(self.filter.to_filter());
        if self.schema_only {
            options.schema_only()
        } else if self.data_only {
            options.data_only()
        } else {
            options
        }
    }
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Print records as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Backup id
    id: Uuid,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Backup id
    id: Uuid,

    /// Print the preview as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Source database connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    /// Directory the migration files are written to
    #[arg(long, default_value = "migrations")]
    out_dir: PathBuf,

    /// Maximum tables per file
    #[arg(long, default_value_t = MigrationOptions::default().max_tables_per_file)]
    max_tables: usize,

    /// Maximum bytes per file
    #[arg(long, default_value_t = MigrationOptions::default().max_bytes_per_file)]
    max_bytes: usize,

    #[command(flatten)]
    filter: FilterArgs,

    /// Print file names without writing
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format)?;

    let catalog: Arc<dyn Catalog> = Arc::new(
        JsonlCatalog::open(&cli.global.catalog)
            .await
            .with_context(|| format!("opening catalog {}", cli.global.catalog.display()))?,
    );

    match &cli.command {
        Command::Backup(args) => backup(catalog, args).await,
        Command::Restore(args) => restore(catalog, args).await,
        Command::List(args) => list(catalog, args).await,
        Command::Verify(args) => verify(catalog, args).await,
        Command::Preview(args) => preview(catalog, args).await,
        Command::Inspect(args) => inspect(catalog, args).await,
        Command::Migrate(args) => migrate(args).await,
    }
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current chunk");
            trigger.cancel();
        }
    });
    token
}

async fn connect(database_url: &str, read_only: bool) -> anyhow::Result<Box<dyn DatabaseAdapter>> {
    info!("Target: {}", redact_database_url(database_url));
    let config = if read_only {
        ConnectionConfig::for_backup()
    } else {
        ConnectionConfig::for_restore()
    };
    let adapter = create_adapter_with_config(database_url, config).await?;
    adapter.test_connection().await?;
    info!("Connected to {}", adapter.database_type());
    Ok(adapter)
}

async fn backup(catalog: Arc<dyn Catalog>, args: &BackupArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    let key = args.key.load()?;
    config.validate_with_key(key.as_ref())?;

    let adapter = connect(&args.database_url, true).await?;
    let manager = BackupManager::new(catalog);
    let record = manager
        .backup(adapter.as_ref(), &config, key.as_ref(), &cancel_on_interrupt())
        .await?;

    println!("Backup completed successfully");
    println!("ID: {}", record.id);
    if let Some(location) = &record.location {
        println!("Artifact: {}", location.display());
    }
    println!("Tables: {}", record.table_count);
    println!("Rows: {}", record.row_count);
    println!("Size: {} bytes", record.size_bytes);
    if let Some(checksum) = &record.checksum {
        println!("SHA-256: {}", checksum);
    }
    Ok(())
}

fn print_report(report: &RestoreReport) {
    println!("Restored tables: {}", report.succeeded.len());
    println!("Rows: {}", report.rows_restored);
    for failure in &report.failed {
        println!("FAILED {}: {}", failure.table, failure.reason);
    }
}

async fn restore(catalog: Arc<dyn Catalog>, args: &RestoreArgs) -> anyhow::Result<()> {
    let options = args.to_options();
    let key = args.key.load()?;
    let adapter = connect(&args.database_url, false).await?;

    let manager = RestoreManager::new(catalog);
    match manager
        .restore(args.id, adapter.as_ref(), &options, key.as_ref())
        .await
    {
        Ok(report) => {
            println!("Restore completed successfully");
            print_report(&report);
            Ok(())
        }
        Err(DbVaultError::PartialRestore(report)) => {
            println!("Restore completed with failures");
            print_report(&report);
            bail!(
                "{} of {} tables failed to restore",
                report.failed.len(),
                report.failed.len().saturating_add(report.succeeded.len())
            )
        }
        Err(error) => Err(error.into()),
    }
}

async fn list(catalog: Arc<dyn Catalog>, args: &ListArgs) -> anyhow::Result<()> {
    let records = BackupManager::new(catalog).list().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No backups in catalog");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<10} {:<9} {:<10} {:>8} rows  {}",
            record.id,
            record.status.to_string(),
            record.mode.to_string(),
            record.name,
            record.row_count,
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn verify(catalog: Arc<dyn Catalog>, args: &VerifyArgs) -> anyhow::Result<()> {
    let report = BackupManager::new(catalog).verify(args.id).await?;
    println!("Catalog: {}", report.expected);
    println!("Footer:  {}", report.footer);
    println!("Actual:  {}", report.actual);
    if !report.valid {
        bail!("backup {} failed verification", report.id);
    }
    println!("Backup {} verified", report.id);
    Ok(())
}

async fn preview(catalog: Arc<dyn Catalog>, args: &BackupArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    let adapter = connect(&args.database_url, true).await?;
    let plan = BackupManager::new(catalog)
        .preview(adapter.as_ref(), &config)
        .await?;

    println!("Mode: {}", plan.mode);
    println!("Layers: {}", plan.layers);
    println!("Artifact: {}", plan.artifact_path.display());
    for (position, table) in plan.tables.iter().enumerate() {
        println!(
            "{:>4}. {} ({} columns, ~{} rows)",
            position.saturating_add(1),
            table.name,
            table.columns,
            table.estimated_rows
        );
    }
    for edge in &plan.broken_edges {
        println!("Deferred foreign key: {}", edge.describe());
    }
    Ok(())
}

async fn inspect(catalog: Arc<dyn Catalog>, args: &InspectArgs) -> anyhow::Result<()> {
    let key = args.key.load()?;
    let preview = RestoreManager::new(catalog)
        .preview(args.id, key.as_ref())
        .await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(());
    }

    println!("Backup: {} ({})", preview.name, preview.backup_id);
    println!("Engine: {}", preview.engine);
    println!("Mode: {}", preview.mode);
    if let Some(cipher) = preview.cipher {
        println!("Cipher: {}", cipher);
    }
    for table in &preview.tables {
        println!(
            "  {} {} rows{}",
            table.name,
            table.rows,
            if table.has_definition { "" } else { " (no definition)" }
        );
    }
    for (table, columns) in &preview.deferred_columns {
        println!("Deferred columns of {}: {}", table, columns.join(", "));
    }
    println!("Total rows: {}", preview.total_rows);
    Ok(())
}

async fn migrate(args: &MigrateArgs) -> anyhow::Result<()> {
    let adapter = connect(&args.database_url, true).await?;
    let snapshot = SchemaAnalyzer::new(adapter.as_ref())
        .analyze_filtered(&args.filter.to_filter())
        .await?;
    let order = DependencyResolver::resolve(&snapshot)?;

    let options = MigrationOptions::default()
        .with_max_tables(args.max_tables)
        .with_max_bytes(args.max_bytes);
    let files = MigrationGenerator::new(adapter.dialect(), options).generate(
        &snapshot,
        &order,
        chrono::Utc::now(),
    )?;

    if args.dry_run {
        for file in &files {
            println!("{} ({} tables)", file.file_name, file.tables.len());
        }
        return Ok(());
    }
    let written = write_all(&files, &args.out_dir)?;
    println!(
        "Wrote {} migration file(s) to {}",
        written.len(),
        args.out_dir.display()
    );
    Ok(())
}
