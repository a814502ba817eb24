//! Batch indexer: applies changed and removed documents to the store.
//!
//! Every batch is one transaction. A failure aborts the build, but batches
//! committed before it stay applied; since the index state is not saved,
//! the next run re-detects and re-applies them. Upserts are therefore
//! written to be idempotent.

use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::Result;
use crate::memory::{AdaptiveBatch, MemoryMonitor};
use crate::models::IssueDocument;
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::source::{self, ScanEntry};

/// Insert or update one issue with its child rows and FTS entry.
/// Returns the row identity.
pub async fn upsert_issue(conn: &mut SqliteConnection, doc: &IssueDocument) -> Result<i64> {
    let taxonomy_json = serde_json::to_string(&doc.taxonomy)?;
    let metadata_json = serde_json::to_string(&doc.metadata)?;

    let row_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO issues (issue_id, source, source_rule_id, language, title, summary, fix_steps,
                            severity, confidence, taxonomy_json, frequency, metadata_json, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(issue_id) DO UPDATE SET
            source = excluded.source,
            source_rule_id = excluded.source_rule_id,
            language = excluded.language,
            title = excluded.title,
            summary = excluded.summary,
            fix_steps = excluded.fix_steps,
            severity = excluded.severity,
            confidence = excluded.confidence,
            taxonomy_json = excluded.taxonomy_json,
            frequency = excluded.frequency,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(&doc.issue_id)
    .bind(&doc.source)
    .bind(&doc.source_rule_id)
    .bind(&doc.language)
    .bind(&doc.title)
    .bind(&doc.summary)
    .bind(&doc.fix_steps)
    .bind(&doc.severity)
    .bind(doc.confidence)
    .bind(&taxonomy_json)
    .bind(doc.frequency)
    .bind(&metadata_json)
    .bind(&doc.updated_at)
    .fetch_one(&mut *conn)
    .await?;

    // Child rows are replaced wholesale, never diffed
    sqlx::query("DELETE FROM signals WHERE issue_id = ?")
        .bind(&doc.issue_id)
        .execute(&mut *conn)
        .await?;
    for (position, signal) in doc.signals.iter().enumerate() {
        sqlx::query("INSERT INTO signals (issue_id, position, kind, value) VALUES (?, ?, ?, ?)")
            .bind(&doc.issue_id)
            .bind(position as i64)
            .bind(&signal.kind)
            .bind(&signal.value)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM references_web WHERE issue_id = ?")
        .bind(&doc.issue_id)
        .execute(&mut *conn)
        .await?;
    for (position, reference) in doc.references.iter().enumerate() {
        sqlx::query(
            "INSERT INTO references_web (issue_id, position, label, url, license) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&doc.issue_id)
        .bind(position as i64)
        .bind(&reference.label)
        .bind(&reference.url)
        .bind(&reference.license)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO fts_issues (rowid, title, summary, fix_steps, signals_concat, language)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row_id)
    .bind(&doc.title)
    .bind(doc.summary.as_deref().unwrap_or(""))
    .bind(doc.fix_steps.as_deref().unwrap_or(""))
    .bind(doc.signals_concat())
    .bind(doc.language.as_deref().unwrap_or(""))
    .execute(&mut *conn)
    .await?;

    Ok(row_id)
}

/// Remove an issue: FTS entry first, then child rows, then the primary row.
/// Returns `false` if the issue was not indexed.
pub async fn delete_issue(conn: &mut SqliteConnection, issue_id: &str) -> Result<bool> {
    let row_id: Option<i64> = sqlx::query_scalar("SELECT id FROM issues WHERE issue_id = ?")
        .bind(issue_id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row_id) = row_id else {
        return Ok(false);
    };

    sqlx::query("DELETE FROM fts_issues WHERE rowid = ?")
        .bind(row_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM signals WHERE issue_id = ?")
        .bind(issue_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM references_web WHERE issue_id = ?")
        .bind(issue_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM issues WHERE id = ?")
        .bind(row_id)
        .execute(&mut *conn)
        .await?;

    Ok(true)
}

/// Counters for one run of the batch indexer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub upserted: usize,
    pub deleted: usize,
    /// Removed keys whose issue id is still present under another key.
    pub skipped_deletes: usize,
    /// Size of every committed batch, in order.
    pub batch_sizes: Vec<usize>,
}

/// Applies a change set in memory-checked transactions.
pub struct BatchIndexer<'a> {
    pool: &'a SqlitePool,
    monitor: &'a MemoryMonitor,
    progress: &'a dyn BuildProgressReporter,
    max_document_bytes: u64,
    batch: AdaptiveBatch,
    stats: IndexStats,
}

impl<'a> BatchIndexer<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        monitor: &'a MemoryMonitor,
        progress: &'a dyn BuildProgressReporter,
        batch_size: usize,
        max_document_bytes: u64,
    ) -> Self {
        Self {
            pool,
            monitor,
            progress,
            max_document_bytes,
            batch: AdaptiveBatch::new(batch_size),
            stats: IndexStats::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch.current()
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    pub fn into_stats(self) -> IndexStats {
        self.stats
    }

    /// Upsert every changed document. Documents are read lazily, one batch
    /// at a time.
    pub async fn write_batches(&mut self, changed: &[ScanEntry]) -> Result<()> {
        let total = changed.len() as u64;
        let mut next = 0;

        while next < changed.len() {
            let window = &changed[next..(next + self.batch.current()).min(changed.len())];
            let size = self.batch.before_batch(self.monitor, average_size(window))?;
            let chunk = &changed[next..(next + size).min(changed.len())];

            let mut tx = self.pool.begin().await?;
            for entry in chunk {
                let doc = source::load_document(&entry.path, self.max_document_bytes)?;
                upsert_issue(&mut *tx, &doc).await?;
            }
            tx.commit().await?;

            next += chunk.len();
            self.stats.upserted += chunk.len();
            self.stats.batch_sizes.push(chunk.len());
            debug!(batch = chunk.len(), done = next, total, "batch committed");
            self.progress.report(BuildProgressEvent::Indexing {
                n: next as u64,
                total,
            });

            self.batch.after_commit(self.monitor)?;
        }

        Ok(())
    }

    /// Delete removed documents. Keys whose issue id is in `live_ids` (the
    /// document moved or is duplicated elsewhere) are left alone.
    pub async fn delete_removed(&mut self, removed: &[String], live_ids: &HashSet<String>) -> Result<()> {
        let mut targets: Vec<&str> = Vec::with_capacity(removed.len());
        for key in removed {
            let issue_id = source::issue_id_for_key(key);
            if live_ids.contains(issue_id) {
                self.stats.skipped_deletes += 1;
            } else {
                targets.push(issue_id);
            }
        }

        let total = targets.len() as u64;
        let mut next = 0;

        while next < targets.len() {
            let size = self.batch.before_batch(self.monitor, 0)?;
            let chunk = &targets[next..(next + size).min(targets.len())];

            let mut tx = self.pool.begin().await?;
            for issue_id in chunk {
                if delete_issue(&mut *tx, issue_id).await? {
                    self.stats.deleted += 1;
                }
            }
            tx.commit().await?;

            next += chunk.len();
            self.stats.batch_sizes.push(chunk.len());
            self.progress.report(BuildProgressEvent::Deleting {
                n: next as u64,
                total,
            });

            self.batch.after_commit(self.monitor)?;
        }

        if self.stats.skipped_deletes > 0 {
            info!(
                skipped = self.stats.skipped_deletes,
                "removed keys still referenced by live documents"
            );
        }
        Ok(())
    }
}

fn average_size(entries: &[ScanEntry]) -> u64 {
    if entries.is_empty() {
        return 0;
    }
    entries.iter().map(|e| e.size_bytes).sum::<u64>() / entries.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::migrate;
    use crate::models::{Reference, Signal};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::ensure_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    fn doc(n: u32, title: &str) -> IssueDocument {
        let mut doc = IssueDocument::new(format!("{:040x}", n), "sonar", title);
        doc.language = Some("java".into());
        doc.signals = vec![Signal { kind: "rule_id".into(), value: format!("S{}", n) }];
        doc.references = vec![Reference {
            label: "rule".into(),
            url: format!("https://rules.example/S{}", n),
            license: None,
        }];
        doc
    }

    async fn count(pool: &SqlitePool, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
    }

    async fn fts_hits(pool: &SqlitePool, term: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM fts_issues WHERE fts_issues MATCH ?")
            .bind(term)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row_and_replaces_children() {
        let (_tmp, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let first = upsert_issue(&mut conn, &doc(1, "Weak cipher")).await.unwrap();
        let mut updated = doc(1, "Weak hashing");
        updated.signals.push(Signal { kind: "tag".into(), value: "crypto".into() });
        let second = upsert_issue(&mut conn, &updated).await.unwrap();
        drop(conn);

        assert_eq!(first, second);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM issues").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM signals").await, 2);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM references_web").await, 1);
        assert_eq!(fts_hits(&pool, "cipher").await, 0);
        assert_eq!(fts_hits(&pool, "hashing").await, 1);
        assert_eq!(fts_hits(&pool, "crypto").await, 1);
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let (_tmp, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        upsert_issue(&mut conn, &doc(1, "Weak cipher")).await.unwrap();
        upsert_issue(&mut conn, &doc(2, "Open redirect")).await.unwrap();

        assert!(delete_issue(&mut conn, &format!("{:040x}", 1)).await.unwrap());
        assert!(!delete_issue(&mut conn, &format!("{:040x}", 1)).await.unwrap());
        drop(conn);

        assert_eq!(count(&pool, "SELECT COUNT(*) FROM issues").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM signals").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM references_web").await, 1);
        assert_eq!(fts_hits(&pool, "cipher").await, 0);
        assert_eq!(fts_hits(&pool, "redirect").await, 1);
    }
}
