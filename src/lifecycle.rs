//! FTS5 maintenance around a build: automerge before writes, merge and
//! optimize after, then an integrity check that gates the state commit.

use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::config::{Config, IndexConfig};
use crate::db;
use crate::error::{KbError, Result};
use crate::monitor::{Event, EventSink, EventStatus};

#[derive(Debug, Clone, Copy)]
pub struct IndexLifecycle {
    automerge: u32,
    merge_pages: u32,
}

impl IndexLifecycle {
    pub fn new(automerge: u32, merge_pages: u32) -> Self {
        Self {
            automerge,
            merge_pages,
        }
    }

    pub fn from_config(index: &IndexConfig) -> Self {
        Self::new(index.automerge, index.merge_pages)
    }

    /// Let FTS5 merge segments incrementally while rows are written.
    pub async fn prepare(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query("INSERT INTO fts_issues(fts_issues, rank) VALUES('automerge', ?)")
            .bind(self.automerge as i64)
            .execute(pool)
            .await?;
        debug!(automerge = self.automerge, "fts automerge configured");
        Ok(())
    }

    /// One explicit merge pass.
    pub async fn merge(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query("INSERT INTO fts_issues(fts_issues, rank) VALUES('merge', ?)")
            .bind(self.merge_pages as i64)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Compact the full-text index into a single segment.
    pub async fn optimize(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query("INSERT INTO fts_issues(fts_issues) VALUES('optimize')")
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Run the FTS5 self-check, then SQLite's own integrity check.
pub async fn check_integrity(pool: &SqlitePool) -> Result<()> {
    if let Err(e) = sqlx::query("INSERT INTO fts_issues(fts_issues) VALUES('integrity-check')")
        .execute(pool)
        .await
    {
        error!(check = "fts5", error = %e, "integrity check failed");
        return Err(KbError::Integrity {
            check: "fts5",
            detail: e.to_string(),
        });
    }

    let rows: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_all(pool)
        .await
        .map_err(|e| KbError::Integrity {
            check: "sqlite",
            detail: e.to_string(),
        })?;

    if rows.len() != 1 || rows[0] != "ok" {
        let detail = rows.join("; ");
        error!(check = "sqlite", detail = %detail, "integrity check failed");
        return Err(KbError::Integrity {
            check: "sqlite",
            detail,
        });
    }

    Ok(())
}

/// Standalone health check against an existing store. Never creates it.
pub async fn run_health_check(config: &Config) -> Result<()> {
    let pool = db::connect_existing(config).await?;
    let result = check_integrity(&pool).await;
    pool.close().await;
    if result.is_ok() {
        info!(db = %config.db.path.display(), "database health OK");
    }
    result
}

/// CLI entry point for `ikb health`. Publishes the outcome to `sink` and
/// raises an alert on failure.
pub async fn run_health_command(config: &Config, sink: &dyn EventSink) -> anyhow::Result<()> {
    match run_health_check(config).await {
        Ok(()) => {
            sink.health_status(true, None);
            sink.record(&Event::new("check_health", EventStatus::Success));
            println!("Database health OK: {}", config.db.path.display());
            Ok(())
        }
        Err(e) => {
            let detail = e.to_string();
            sink.health_status(false, Some(&detail));
            sink.record(&Event::new("check_health", EventStatus::Failure).with("error", detail.clone()));
            sink.critical(&format!("database health check failed: {}", detail));
            Err(e.into())
        }
    }
}
