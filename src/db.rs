use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::error::{KbError, Result};

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path, config.db.busy_timeout_ms, true).await
}

/// Open an existing store without creating it.
pub async fn connect_existing(config: &Config) -> Result<SqlitePool> {
    if !config.db.path.exists() {
        return Err(KbError::NotFound(format!(
            "{} does not exist",
            config.db.path.display()
        )));
    }
    connect_path(&config.db.path, config.db.busy_timeout_ms, false).await
}

pub async fn connect_path(db_path: &Path, busy_timeout_ms: u64, create: bool) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if create {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    // WAL: one writer, many readers. busy_timeout bounds how long a commit waits.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(busy_timeout_ms));

    // One connection per process: FTS5 control commands and batch
    // transactions must run on the same handle.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}
