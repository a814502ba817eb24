//! Core data models used throughout the knowledge base.
//!
//! [`IssueDocument`] is the canonical on-disk record. Collectors may leave
//! any optional field out; only `issue_id`, `source` and `title` are
//! required before a document is written to the index.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{KbError, Result};

/// Length of an issue id (hex-encoded SHA-1 of the originating rule).
pub const ISSUE_ID_LEN: usize = 40;

/// One piece of evidence attached to an issue (e.g. `rule_id = S2077`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: String,
    pub value: String,
}

/// External documentation link for an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub label: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

/// Canonical issue record, one JSON file per issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDocument {
    pub issue_id: String,
    pub source: String,
    #[serde(default)]
    pub source_rule_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub fix_steps: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default = "empty_object")]
    pub taxonomy: serde_json::Value,
    #[serde(default)]
    pub frequency: Option<i64>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub signals: Vec<Signal>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Whether `id` is a well-formed issue id: exactly 40 lowercase hex digits.
pub fn is_valid_issue_id(id: &str) -> bool {
    id.len() == ISSUE_ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl IssueDocument {
    /// Minimal document with only the mandatory fields set.
    pub fn new(issue_id: impl Into<String>, source: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            issue_id: issue_id.into(),
            source: source.into(),
            source_rule_id: None,
            language: None,
            title: title.into(),
            summary: None,
            fix_steps: None,
            severity: None,
            confidence: None,
            taxonomy: empty_object(),
            frequency: None,
            metadata: empty_object(),
            signals: Vec::new(),
            references: Vec::new(),
            updated_at: None,
        }
    }

    /// Check the mandatory subset. `path` only labels the error.
    pub fn validate(&self, path: &Path) -> Result<()> {
        if !is_valid_issue_id(&self.issue_id) {
            return Err(KbError::validation(
                path,
                format!(
                    "issue_id must be a {}-character lowercase hex string, got '{}'",
                    ISSUE_ID_LEN, self.issue_id
                ),
            ));
        }
        if self.source.trim().is_empty() {
            return Err(KbError::validation(path, "source is empty"));
        }
        if self.title.trim().is_empty() {
            return Err(KbError::validation(path, "title is empty"));
        }
        Ok(())
    }

    /// Space-joined signal values, as indexed in the `signals_concat` column.
    pub fn signals_concat(&self) -> String {
        self.signals
            .iter()
            .map(|s| s.value.trim())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Directory name used for the language level of the document tree.
    pub fn language_dir(&self) -> String {
        self.language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A ranked hit returned by the query engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub issue_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub fix_steps: Option<String>,
    pub language: Option<String>,
    /// Relevance, higher is better (negated FTS5 rank).
    pub score: f64,
}
