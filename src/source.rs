//! Document source reader.
//!
//! Walks the document tree (`<root>/<source>/<language>/<issue_id>.json`),
//! reports every file with its modification timestamp, and loads individual
//! documents on demand with a hard size bound.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::error::{KbError, Result};
use crate::models::IssueDocument;

const DOCUMENT_GLOB: &str = "*/*/*.json";

/// One document file found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// Path relative to the documents root, `/`-separated.
    pub key: String,
    pub path: PathBuf,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
    pub size_bytes: u64,
}

/// Enumerate all document files under `root`, sorted by key.
pub fn scan_documents(root: &Path) -> Result<Vec<ScanEntry>> {
    if !root.is_dir() {
        return Err(KbError::NotFound(format!(
            "documents root does not exist: {}",
            root.display()
        )));
    }

    let matcher = build_globset(&[DOCUMENT_GLOB])?;
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(3).max_depth(3) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if !matcher.is_match(&key) {
            continue;
        }

        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        entries.push(ScanEntry {
            key,
            path: path.to_path_buf(),
            mtime_ns: mtime_ns(metadata.modified()?),
            size_bytes: metadata.len(),
        });
    }

    // Sort for deterministic ordering
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(entries)
}

/// Issue id a document key refers to (the file stem).
pub fn issue_id_for_key(key: &str) -> &str {
    let file = key.rsplit('/').next().unwrap_or(key);
    file.strip_suffix(".json").unwrap_or(file)
}

/// Read, parse and validate one document.
///
/// Rejects files larger than `max_bytes` before reading them, and documents
/// whose `issue_id` does not match their file name (deletes are derived
/// from the file name, so a mismatch would orphan the row).
pub fn load_document(path: &Path, max_bytes: u64) -> Result<IssueDocument> {
    let size = fs::metadata(path)?.len();
    if size > max_bytes {
        return Err(KbError::validation(
            path,
            format!("document is {} bytes, limit is {}", size, max_bytes),
        ));
    }

    let raw = fs::read(path)?;
    let doc: IssueDocument = serde_json::from_slice(&raw)
        .map_err(|e| KbError::validation(path, format!("malformed JSON: {}", e)))?;
    doc.validate(path)?;

    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    if stem != doc.issue_id.as_str() {
        return Err(KbError::validation(
            path,
            format!("issue_id '{}' does not match file name", doc.issue_id),
        ));
    }

    Ok(doc)
}

/// Write `doc` to its canonical location under `root` and return the path.
///
/// Stamps `updated_at` when the collector left it empty.
pub fn write_issue(root: &Path, doc: &IssueDocument) -> Result<PathBuf> {
    let path_label = root.join(&doc.source);
    doc.validate(&path_label)?;
    if doc.source.contains(['/', '\\']) || doc.source.starts_with('.') {
        return Err(KbError::validation(path_label, "source is not a plain directory name"));
    }

    let language = doc.language_dir();
    if language.contains(['/', '\\']) || language.starts_with('.') {
        return Err(KbError::validation(path_label, "language is not a plain directory name"));
    }

    let dir = root.join(&doc.source).join(&language);
    fs::create_dir_all(&dir)?;

    let mut out = doc.clone();
    if out.updated_at.is_none() {
        out.updated_at = Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
    }

    let path = dir.join(format!("{}.json", out.issue_id));
    fs::write(&path, serde_json::to_vec_pretty(&out)?)?;
    Ok(path)
}

fn mtime_ns(modified: SystemTime) -> i64 {
    modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        builder.add(glob);
    }
    Ok(builder
        .build()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(n: u32) -> String {
        format!("{:040x}", n)
    }

    #[test]
    fn scan_only_picks_three_level_json() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_issue(root, &IssueDocument::new(id(1), "sonar", "one")).unwrap();
        fs::write(root.join("stray.json"), "{}").unwrap();
        fs::create_dir_all(root.join("sonar/java")).unwrap();
        fs::write(root.join("sonar/java/notes.txt"), "x").unwrap();

        let entries = scan_documents(root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, format!("sonar/unknown/{}.json", id(1)));
        assert!(entries[0].mtime_ns > 0);
    }

    #[test]
    fn missing_root_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = scan_documents(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, KbError::NotFound(_)));
    }

    #[test]
    fn load_rejects_oversized_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_issue(tmp.path(), &IssueDocument::new(id(2), "src", "big")).unwrap();
        let err = load_document(&path, 10).unwrap_err();
        assert!(matches!(err, KbError::Validation { .. }));
    }

    #[test]
    fn load_rejects_id_name_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = write_issue(tmp.path(), &IssueDocument::new(id(3), "src", "t")).unwrap();
        let moved = path.with_file_name(format!("{}.json", id(4)));
        fs::rename(&path, &moved).unwrap();
        assert!(load_document(&moved, 1 << 20).is_err());
    }

    #[test]
    fn load_rejects_missing_title() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("src/py");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.json", id(5)));
        fs::write(&path, format!(r#"{{"issue_id":"{}","source":"src"}}"#, id(5))).unwrap();
        let err = load_document(&path, 1 << 20).unwrap_err();
        assert!(err.to_string().contains("malformed JSON"));
    }

    #[test]
    fn write_issue_lowercases_language_and_stamps_time() {
        let tmp = TempDir::new().unwrap();
        let mut doc = IssueDocument::new(id(6), "src", "ok");
        doc.language = Some("Java".into());
        let path = write_issue(tmp.path(), &doc).unwrap();
        assert_eq!(path, tmp.path().join("src/java").join(format!("{}.json", id(6))));
        let back = load_document(&path, 1 << 20).unwrap();
        assert!(back.updated_at.is_some());
    }

    #[test]
    fn write_issue_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let doc = IssueDocument::new("../../../etc/passwd", "src", "bad");
        assert!(write_issue(tmp.path(), &doc).is_err());
        let doc = IssueDocument::new(id(7), "../escape", "bad");
        assert!(write_issue(tmp.path(), &doc).is_err());
    }

    #[test]
    fn issue_id_from_key() {
        assert_eq!(issue_id_for_key("src/py/abc.json"), "abc");
    }
}
