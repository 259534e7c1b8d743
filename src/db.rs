use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Resolve the database file path: use the custom path if provided,
/// otherwise fall back to `$XDG_DATA_HOME/treesyncd/sync.db`.
pub fn resolve_db_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => {
            let dir = dirs::data_dir().context("Could not determine data directory")?;
            Ok(dir.join("treesyncd").join("sync.db"))
        }
    }
}

/// Open the existing database in read-only mode.
/// Returns `None` if the database file doesn't exist (first run).
/// Skips migrations since we can't write.
pub async fn open_db_readonly(custom: Option<&Path>) -> Result<Option<SqlitePool>> {
    let db_path = resolve_db_path(custom)?;

    if !db_path.exists() {
        return Ok(None);
    }

    let db_url = format!("sqlite:{}?mode=ro", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .with_context(|| format!("Failed to open database read-only: {}", db_path.display()))?;

    Ok(Some(pool))
}

/// Open (creating if needed) and migrate the database. Several workers share
/// the pool, so the file runs in WAL mode with a busy timeout; contention
/// beyond that surfaces as a transient database error on the task.
pub async fn init_db(custom: Option<&Path>) -> Result<SqlitePool> {
    let db_path = resolve_db_path(custom)?;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    tracing::debug!(path = %db_path.display(), "opening database");

    let options = SqliteConnectOptions::from_str(&db_url)
        .with_context(|| format!("Invalid database path: {}", db_path.display()))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!(path = %db_path.display(), "database initialized");
    Ok(pool)
}
