//! Issue retrieval by id.
//!
//! Reassembles the full [`IssueDocument`] from the relational tables, so
//! `ikb get` output can be diffed against the file on disk.

use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::{KbError, Result};
use crate::models::{IssueDocument, Reference, Signal};

pub async fn get_issue(config: &Config, issue_id: &str) -> Result<IssueDocument> {
    let pool = db::connect_existing(config).await?;
    let result = fetch_issue(&pool, issue_id).await;
    pool.close().await;
    result
}

pub async fn fetch_issue(pool: &SqlitePool, issue_id: &str) -> Result<IssueDocument> {
    let row = sqlx::query(
        r#"
        SELECT issue_id, source, source_rule_id, language, title, summary, fix_steps,
               severity, confidence, taxonomy_json, frequency, metadata_json, updated_at
        FROM issues WHERE issue_id = ?
        "#,
    )
    .bind(issue_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| KbError::NotFound(format!("issue {}", issue_id)))?;

    let taxonomy_json: String = row.get("taxonomy_json");
    let metadata_json: String = row.get("metadata_json");

    let signals = sqlx::query("SELECT kind, value FROM signals WHERE issue_id = ? ORDER BY position")
        .bind(issue_id)
        .fetch_all(pool)
        .await?
        .iter()
        .map(|r| Signal {
            kind: r.get("kind"),
            value: r.get("value"),
        })
        .collect();

    let references = sqlx::query(
        "SELECT label, url, license FROM references_web WHERE issue_id = ? ORDER BY position",
    )
    .bind(issue_id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|r| Reference {
        label: r.get("label"),
        url: r.get("url"),
        license: r.get("license"),
    })
    .collect();

    Ok(IssueDocument {
        issue_id: row.get("issue_id"),
        source: row.get("source"),
        source_rule_id: row.get("source_rule_id"),
        language: row.get("language"),
        title: row.get("title"),
        summary: row.get("summary"),
        fix_steps: row.get("fix_steps"),
        severity: row.get("severity"),
        confidence: row.get("confidence"),
        taxonomy: serde_json::from_str(&taxonomy_json)?,
        frequency: row.get("frequency"),
        metadata: serde_json::from_str(&metadata_json)?,
        signals,
        references,
        updated_at: row.get("updated_at"),
    })
}

/// CLI entry point for `ikb get`: prints the issue as pretty JSON.
pub async fn run_get(config: &Config, issue_id: &str) -> anyhow::Result<()> {
    let doc = get_issue(config, issue_id).await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::upsert_issue;
    use crate::migrate;
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trips_through_the_store() {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::ensure_schema(&pool).await.unwrap();

        let mut doc = IssueDocument::new("c".repeat(40), "semgrep", "Weak hash");
        doc.language = Some("java".into());
        doc.confidence = Some(0.75);
        doc.taxonomy = serde_json::json!({"cwe": ["CWE-328"]});
        doc.signals = vec![
            Signal { kind: "rule_id".into(), value: "weak-md5".into() },
            Signal { kind: "api".into(), value: "MessageDigest".into() },
        ];
        doc.references = vec![Reference {
            label: "OWASP".into(),
            url: "https://owasp.org".into(),
            license: None,
        }];
        {
            let mut conn = pool.acquire().await.unwrap();
            upsert_issue(&mut conn, &doc).await.unwrap();
        }

        let fetched = fetch_issue(&pool, &doc.issue_id).await.unwrap();
        assert_eq!(fetched, doc);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::ensure_schema(&pool).await.unwrap();
        let err = fetch_issue(&pool, &"d".repeat(40)).await.unwrap_err();
        assert!(matches!(err, KbError::NotFound(_)));
    }
}
