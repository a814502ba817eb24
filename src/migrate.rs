use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::Result;

/// Create the issue store schema on `config.db.path`. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // Primary issue rows. `id` is the stable row identity shared with fts_issues.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            id INTEGER PRIMARY KEY,
            issue_id TEXT NOT NULL UNIQUE,
            source TEXT NOT NULL,
            source_rule_id TEXT,
            language TEXT,
            title TEXT NOT NULL,
            summary TEXT,
            fix_steps TEXT,
            severity TEXT,
            confidence REAL,
            taxonomy_json TEXT NOT NULL DEFAULT '{}',
            frequency INTEGER,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signals (
            id INTEGER PRIMARY KEY,
            issue_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            FOREIGN KEY (issue_id) REFERENCES issues(issue_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS references_web (
            id INTEGER PRIMARY KEY,
            issue_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            label TEXT NOT NULL,
            url TEXT NOT NULL,
            license TEXT,
            FOREIGN KEY (issue_id) REFERENCES issues(issue_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is checked first so re-running never touches an existing index
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='fts_issues'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        // Contentless: text lives only in `issues`. contentless_delete allows
        // DELETE and INSERT OR REPLACE keyed by rowid.
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE fts_issues USING fts5(
                title,
                summary,
                fix_steps,
                signals_concat,
                language,
                content='',
                contentless_delete=1,
                tokenize='porter unicode61',
                prefix='2 3 4'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_issue_id ON signals(issue_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_references_issue_id ON references_web(issue_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_source ON issues(source, language)")
        .execute(pool)
        .await?;

    Ok(())
}
