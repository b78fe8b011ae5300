//! Content-hash based change detection.
//!
//! [`diff_documents`] compares the `(path, hash)` view of a fresh scan
//! against the view held by the document store and partitions paths into
//! four disjoint, sorted sets.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// SHA-256 of raw bytes, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Classification of every path seen now or before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentDiff {
    /// Present now, absent before.
    pub new: Vec<String>,
    /// Present in both with a different hash.
    pub changed: Vec<String>,
    /// Absent now, present before.
    pub deleted: Vec<String>,
    /// Present in both with the same hash.
    pub unchanged: Vec<String>,
}

impl DocumentDiff {
    pub fn has_changes(&self) -> bool {
        !(self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty())
    }

    /// Paths that need (re)processing, new first then changed.
    pub fn pending(&self) -> impl Iterator<Item = &String> {
        self.new.iter().chain(self.changed.iter())
    }
}

pub fn diff_documents(
    current: &BTreeMap<String, String>,
    previous: &BTreeMap<String, String>,
) -> DocumentDiff {
    let mut diff = DocumentDiff::default();

    for (path, hash) in current {
        match previous.get(path) {
            None => diff.new.push(path.clone()),
            Some(prev) if prev != hash => diff.changed.push(path.clone()),
            Some(_) => diff.unchanged.push(path.clone()),
        }
    }

    diff.deleted = previous
        .keys()
        .filter(|path| !current.contains_key(*path))
        .cloned()
        .collect();

    diff
}
