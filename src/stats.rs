//! Store statistics.
//!
//! A quick summary of what is indexed: issue, signal and reference counts,
//! the store size, how many files the last successful build tracked, and a
//! per-source and per-language breakdown. Used by `ikb stats` to give
//! confidence that builds are landing.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::state::IndexState;

#[derive(Debug, Clone, Serialize)]
pub struct BreakdownRow {
    pub source: String,
    pub language: String,
    pub issues: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub issues: i64,
    pub signals: i64,
    pub references: i64,
    pub db_bytes: u64,
    pub tracked_files: usize,
    pub breakdown: Vec<BreakdownRow>,
}

pub async fn collect_stats(config: &Config) -> Result<StoreStats> {
    let pool = db::connect_existing(config).await?;
    let result = query_stats(&pool).await;
    pool.close().await;

    let (issues, signals, references, breakdown) = result?;
    let db_bytes = std::fs::metadata(&config.db.path).map(|m| m.len()).unwrap_or(0);
    let tracked_files = IndexState::load(&config.state.path)?.len();

    Ok(StoreStats {
        issues,
        signals,
        references,
        db_bytes,
        tracked_files,
        breakdown,
    })
}

async fn query_stats(pool: &SqlitePool) -> Result<(i64, i64, i64, Vec<BreakdownRow>)> {
    let issues: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM issues")
        .fetch_one(pool)
        .await?;
    let signals: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM signals")
        .fetch_one(pool)
        .await?;
    let references: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM references_web")
        .fetch_one(pool)
        .await?;

    let breakdown = sqlx::query(
        r#"
        SELECT source, COALESCE(language, 'unknown') AS language, COUNT(*) AS issues
        FROM issues
        GROUP BY source, language
        ORDER BY issues DESC, source, language
        "#,
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| BreakdownRow {
        source: row.get("source"),
        language: row.get("language"),
        issues: row.get("issues"),
    })
    .collect();

    Ok((issues, signals, references, breakdown))
}

/// Run the stats command and print a summary.
pub async fn run_stats(config: &Config) -> anyhow::Result<()> {
    let stats = collect_stats(config).await?;

    println!("Issues KB: Store Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(stats.db_bytes));
    println!("  Tracked:     {} files", stats.tracked_files);
    println!();
    println!("  Issues:      {}", stats.issues);
    println!("  Signals:     {}", stats.signals);
    println!("  References:  {}", stats.references);

    if !stats.breakdown.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<24} {:<16} {:>8}", "SOURCE", "LANGUAGE", "ISSUES");
        println!("  {}", "-".repeat(50));
        for row in &stats.breakdown {
            println!("  {:<24} {:<16} {:>8}", row.source, row.language, row.issues);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
