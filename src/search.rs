//! Ranked full-text search over the issue index.
//!
//! User text is never handed to FTS5 verbatim: it is reduced to word
//! tokens, each token is quoted, and the last one (or all of them) becomes
//! a prefix term. Results are ordered by bm25 with the row id as a
//! tie-breaker.

use lru::LruCache;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

use crate::config::{Config, SearchConfig};
use crate::db;
use crate::error::Result;
use crate::models::SearchResult;

/// Process-wide query counters. Only ever incremented. Every physical
/// query counts, failed ones included; cache hits do not.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    queries: AtomicU64,
    latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queries: u64,
    pub total_latency_micros: u64,
}

impl QueryMetrics {
    pub fn record(&self, micros: u64) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            total_latency_micros: self.latency_micros.load(Ordering::Relaxed),
        }
    }
}

type CacheKey = (String, usize);

const DEFAULT_CLI_LIMIT: usize = 10;

pub struct QueryEngine {
    pool: SqlitePool,
    max_limit: usize,
    prefix_all_tokens: bool,
    cache: Mutex<LruCache<CacheKey, Vec<SearchResult>>>,
    metrics: Arc<QueryMetrics>,
}

impl QueryEngine {
    pub fn new(pool: SqlitePool, config: &SearchConfig) -> Self {
        Self::with_metrics(pool, config, Arc::new(QueryMetrics::default()))
    }

    /// Build an engine that reports into an existing metrics instance.
    pub fn with_metrics(pool: SqlitePool, config: &SearchConfig, metrics: Arc<QueryMetrics>) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            pool,
            max_limit: config.max_limit.max(1),
            prefix_all_tokens: config.prefix_all_tokens,
            cache: Mutex::new(LruCache::new(capacity)),
            metrics,
        }
    }

    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect_existing(config).await?;
        Ok(Self::new(pool, &config.search))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn clear_cache(&self) {
        self.lock().clear();
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Ranked search. `limit` is clamped to `[1, max_limit]`.
    pub async fn search(&self, query_text: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let limit = limit.clamp(1, self.max_limit);
        let key = (query_text.to_string(), limit);

        if let Some(hit) = self.lock().get(&key) {
            debug!(query = query_text, limit, "search cache hit");
            return Ok(hit.clone());
        }

        let Some(expression) = build_match_expression(query_text, self.prefix_all_tokens) else {
            return Ok(Vec::new());
        };

        let started = Instant::now();
        let outcome = self.query_index(&expression, limit).await;
        let elapsed = started.elapsed();
        self.metrics.record(elapsed.as_micros() as u64);
        let results = outcome?;
        debug!(
            query = query_text,
            expression = %expression,
            hits = results.len(),
            micros = elapsed.as_micros() as u64,
            "search executed"
        );

        self.lock().put(key, results.clone());
        Ok(results)
    }

    async fn query_index(&self, expression: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let rows = sqlx::query(
            r#"
            SELECT i.issue_id, i.title, i.summary, i.fix_steps, i.language, fts_issues.rank AS rank
            FROM fts_issues
            JOIN issues i ON i.id = fts_issues.rowid
            WHERE fts_issues MATCH ?
            ORDER BY fts_issues.rank, i.id
            LIMIT ?
            "#,
        )
        .bind(expression)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let results = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchResult {
                    issue_id: row.get("issue_id"),
                    title: row.get("title"),
                    summary: row.get("summary"),
                    fix_steps: row.get("fix_steps"),
                    language: row.get("language"),
                    score: -rank, // negate so higher = better
                }
            })
            .collect();

        Ok(results)
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, Vec<SearchResult>>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// CLI entry point for `ikb search`.
pub async fn run_search(config: &Config, query_text: &str, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    let engine = QueryEngine::open(config).await?;
    let limit = limit.unwrap_or(DEFAULT_CLI_LIMIT);
    let results = engine.search(query_text, limit).await;
    engine.close().await;
    let results = results?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} ({})",
            i + 1,
            r.score,
            r.title,
            r.language.as_deref().unwrap_or("unknown")
        );
        println!("    id: {}", r.issue_id);
        if let Some(summary) = r.summary.as_deref().filter(|s| !s.is_empty()) {
            println!("    {}", summary);
        }
    }
    Ok(())
}

/// Split user text into word tokens, dropping FTS5 syntax characters.
pub fn sanitize_query(query_text: &str) -> Vec<String> {
    query_text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// FTS5 MATCH expression for `query_text`, or `None` if nothing searchable
/// is left after sanitizing.
///
/// Tokens are quoted so words like `NOT` or `NEAR` stay literal; quoted
/// tokens are ANDed implicitly.
pub fn build_match_expression(query_text: &str, prefix_all_tokens: bool) -> Option<String> {
    let tokens = sanitize_query(query_text);
    let last = tokens.len().checked_sub(1)?;

    let terms: Vec<String> = tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            if prefix_all_tokens || i == last {
                format!("\"{}\"*", token)
            } else {
                format!("\"{}\"", token)
            }
        })
        .collect();

    Some(terms.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::upsert_issue;
    use crate::migrate;
    use crate::models::IssueDocument;
    use tempfile::TempDir;

    #[test]
    fn sanitize_strips_operators() {
        assert_eq!(sanitize_query("sql* OR (\"inject\")"), vec!["sql", "OR", "inject"]);
        assert_eq!(sanitize_query("  -^:  "), Vec::<String>::new());
        assert_eq!(sanitize_query("path_traversal"), vec!["path_traversal"]);
    }

    #[test]
    fn match_expression_prefixes_last_token() {
        assert_eq!(
            build_match_expression("weak cryp", false).as_deref(),
            Some("\"weak\" \"cryp\"*")
        );
        assert_eq!(
            build_match_expression("weak cryp", true).as_deref(),
            Some("\"weak\"* \"cryp\"*")
        );
        assert_eq!(build_match_expression("***", false), None);
    }

    async fn engine_with(docs: &[IssueDocument]) -> (TempDir, QueryEngine) {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::ensure_schema(&pool).await.unwrap();
        {
            let mut conn = pool.acquire().await.unwrap();
            for doc in docs {
                upsert_issue(&mut conn, doc).await.unwrap();
            }
        }
        (tmp, QueryEngine::new(pool, &config.search))
    }

    #[tokio::test]
    async fn prefix_query_finds_document_and_counts() {
        let mut doc = IssueDocument::new("a".repeat(40), "src", "Example rule");
        doc.summary = Some("Demo summary".into());
        doc.language = Some("py".into());
        let (_tmp, engine) = engine_with(&[doc]).await;

        let rows = engine.search("Exam", 5).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].issue_id, "a".repeat(40));
        assert_eq!(rows[0].title, "Example rule");
        assert_eq!(rows[0].language.as_deref(), Some("py"));
        assert_eq!(rows[0].summary.as_deref(), Some("Demo summary"));
        assert_eq!(engine.metrics().queries, 1);
    }

    #[tokio::test]
    async fn repeated_term_ranks_first() {
        let once = IssueDocument::new("1".repeat(40), "src", "Injection flaw");
        let mut thrice = IssueDocument::new("2".repeat(40), "src", "Injection injection injection");
        thrice.summary = Some("unrelated".into());
        let (_tmp, engine) = engine_with(&[once, thrice]).await;

        let rows = engine.search("injec", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].issue_id, "2".repeat(40));
        assert!(rows[0].score > rows[1].score);
    }

    #[tokio::test]
    async fn identical_queries_hit_cache() {
        let (_tmp, engine) = engine_with(&[IssueDocument::new("3".repeat(40), "src", "demo")]).await;

        let first = engine.search("demo", 1).await.unwrap();
        let second = engine.search("demo", 1).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.metrics().queries, 1);

        engine.search("demo", 2).await.unwrap();
        assert_eq!(engine.metrics().queries, 2);

        engine.clear_cache();
        engine.search("demo", 1).await.unwrap();
        assert_eq!(engine.metrics().queries, 3);
    }

    #[tokio::test]
    async fn no_match_is_empty_not_error() {
        let (_tmp, engine) = engine_with(&[IssueDocument::new("4".repeat(40), "src", "demo")]).await;
        assert!(engine.search("zzzz", 10).await.unwrap().is_empty());
        assert!(engine.search("\"(*", 10).await.unwrap().is_empty());
        assert_eq!(engine.metrics().queries, 1);
    }

    #[tokio::test]
    async fn limit_is_clamped() {
        let docs: Vec<IssueDocument> = (0..5u32)
            .map(|n| IssueDocument::new(format!("{:040x}", n), "src", "shared title"))
            .collect();
        let (_tmp, engine) = engine_with(&docs).await;
        assert_eq!(engine.search("shared", 0).await.unwrap().len(), 1);
        assert_eq!(engine.search("shared", 10_000).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn closed_store_propagates_and_is_not_cached() {
        let (_tmp, engine) = engine_with(&[IssueDocument::new("5".repeat(40), "src", "demo")]).await;
        engine.pool.close().await;
        assert!(engine.search("demo", 1).await.is_err());
        assert_eq!(engine.lock().len(), 0);
        assert_eq!(engine.metrics().queries, 1);
    }
}
