use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Last observed modification time (ns) for every indexed document key.
///
/// Written only at the end of a fully successful build, so a failed run
/// leaves the previous state in place and the next run re-detects every
/// document it touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexState {
    entries: BTreeMap<String, i64>,
}

impl IndexState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the state file, or an empty state if it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let state: IndexState = serde_json::from_str(&content)?;
        Ok(state)
    }

    /// Replace the state file wholesale. The new content is written to a
    /// sibling temp file first and renamed over the old one.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;

        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, mtime_ns: i64) {
        self.entries.insert(key.into(), mtime_ns);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let state = IndexState::load(&tmp.path().join("index_state.json")).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn save_writes_flat_json_object() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kb/index_state.json");
        let mut state = IndexState::new();
        state.insert("src/py/a.json", 42);
        state.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"src/py/a.json": 42}));
        assert_eq!(IndexState::load(&path).unwrap(), state);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
