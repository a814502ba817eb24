//! Change detection between a document scan and the persisted index state.

use crate::source::ScanEntry;
use crate::state::IndexState;

/// Outcome of comparing the current scan to the previous [`IndexState`].
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// New documents, or documents whose timestamp differs from the state.
    pub changed: Vec<ScanEntry>,
    /// Keys recorded in the old state that are no longer on disk.
    pub removed: Vec<String>,
    /// Key → timestamp for everything in the current scan.
    pub new_state: IndexState,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Classify `scan` against `old`. Pure: touches neither disk nor store.
///
/// Any timestamp difference counts as a change, including a clock moving
/// backwards.
pub fn detect_changes(scan: &[ScanEntry], old: &IndexState) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for entry in scan {
        changes.new_state.insert(entry.key.clone(), entry.mtime_ns);
        if old.get(&entry.key) != Some(entry.mtime_ns) {
            changes.changed.push(entry.clone());
        }
    }

    changes.removed = old
        .keys()
        .filter(|key| !changes.new_state.contains(key))
        .map(str::to_string)
        .collect();

    changes
}
