//! Migration generation against live SQLite schemas.
//!
//! Generated files are written to disk, replayed in file-name order into a
//! fresh database, and the result is introspected again.

#![cfg(feature = "sqlite")]

use chrono::{TimeZone, Utc};
use dbvault_core::{
    DatabaseAdapter, MigrationGenerator, MigrationOptions, Result, SchemaAnalyzer,
    adapters::sqlite::SqliteAdapter, migration::write_all, resolver::DependencyResolver,
};

const LIBRARY_SCHEMA: &[&str] = &[
    "CREATE TABLE loans (id INTEGER PRIMARY KEY, copy_id INTEGER NOT NULL REFERENCES copies(id), member_id INTEGER NOT NULL REFERENCES members(id), due TEXT)",
    "CREATE TABLE copies (id INTEGER PRIMARY KEY, book_id INTEGER NOT NULL REFERENCES books(id), shelf TEXT)",
    "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT NOT NULL, author_id INTEGER REFERENCES authors(id))",
    "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE members (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE, referred_by INTEGER REFERENCES members(id))",
    "CREATE INDEX idx_loans_due ON loans (due)",
];

async fn library() -> SqliteAdapter {
    let adapter = SqliteAdapter::new("sqlite::memory:").await.unwrap();
    for statement in LIBRARY_SCHEMA {
        sqlx::query(statement).execute(&adapter.pool).await.unwrap();
    }
    adapter
}

#[tokio::test]
async fn test_generated_files_recreate_the_schema() -> Result<()> {
    let source = library().await;
    let snapshot = SchemaAnalyzer::new(&source).analyze().await?;
    let order = DependencyResolver::resolve(&snapshot)?;

    let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
    let files = MigrationGenerator::new(
        source.dialect(),
        MigrationOptions::default().with_max_tables(2),
    )
    .generate(&snapshot, &order, timestamp)?;

    let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "20240501083000_0001_authors.sql",
            "20240501083000_0002_copies.sql",
            "20240501083000_0003_loans.sql",
        ]
    );
    let tables: Vec<String> = files.iter().flat_map(|f| f.tables.clone()).collect();
    assert_eq!(tables, order.tables);

    let dir = tempfile::tempdir().unwrap();
    let mut written = write_all(&files, dir.path())?;
    assert_eq!(written.len(), 3);
    written.sort();

    let target = SqliteAdapter::new("sqlite::memory:").await?;
    for path in &written {
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("-- Generated by dbvault"));
        sqlx::raw_sql(&content).execute(&target.pool).await.unwrap();
    }

    let recreated = SchemaAnalyzer::new(&target).analyze().await?;
    assert_eq!(recreated.table_names(), snapshot.table_names());
    for table in snapshot.tables() {
        let copy = recreated.table(&table.name).unwrap();
        assert_eq!(copy.column_names(), table.column_names(), "{}", table.name);
        assert_eq!(copy.primary_key, table.primary_key, "{}", table.name);
        assert_eq!(
            copy.foreign_keys.len(),
            table.foreign_keys.len(),
            "{}",
            table.name
        );
    }
    let loans = recreated.table("loans").unwrap();
    assert!(loans.secondary_indexes().any(|index| index.name == "idx_loans_due"));
    Ok(())
}

#[tokio::test]
async fn test_byte_limit_splits_files() -> Result<()> {
    let source = library().await;
    let snapshot = SchemaAnalyzer::new(&source).analyze().await?;
    let order = DependencyResolver::resolve(&snapshot)?;

    let files = MigrationGenerator::new(
        source.dialect(),
        MigrationOptions::default().with_max_bytes(1),
    )
    .generate(&snapshot, &order, Utc::now())?;

    // Every table is larger than the limit, so each gets a file of its own
    assert_eq!(files.len(), snapshot.len());
    assert!(files.iter().all(|file| file.tables.len() == 1));
    Ok(())
}

#[tokio::test]
async fn test_rerun_does_not_overwrite() -> Result<()> {
    let source = library().await;
    let snapshot = SchemaAnalyzer::new(&source).analyze().await?;
    let order = DependencyResolver::resolve(&snapshot)?;
    let files = MigrationGenerator::new(source.dialect(), MigrationOptions::default())
        .generate(&snapshot, &order, Utc::now())?;
    assert_eq!(files.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    write_all(&files, dir.path())?;
    let path = dir.path().join(&files[0].file_name);
    std::fs::write(&path, "-- edited by hand\n").unwrap();

    assert!(write_all(&files, dir.path()).is_err());
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "-- edited by hand\n"
    );
    Ok(())
}
