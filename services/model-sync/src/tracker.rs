//! In-memory record of the last content hash synced to each local artifact path.
//!
//! Nothing here is persisted. After a restart every artifact looks first-seen,
//! which at worst costs one idempotent re-download.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedArtifact {
    pub last_hash: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: HashMap<PathBuf, TrackedArtifact>,
}

impl ChangeTracker {
    pub fn new() -> Self { Self::default() }

    /// Check-and-commit in one step: records `hash` when it differs from the
    /// stored one (or nothing is stored) and reports whether it did.
    pub fn has_changed(&mut self, path: &Path, hash: &str) -> bool {
        if !self.peek_changed(path, hash) { return false; }
        self.commit(path, hash);
        true
    }

    /// Same comparison as `has_changed` without recording anything.
    pub fn peek_changed(&self, path: &Path, hash: &str) -> bool {
        self.entries.get(path).map_or(true, |t| t.last_hash != hash)
    }

    /// Record `hash` as synced for `path`. Call only after the local file is in place.
    pub fn commit(&mut self, path: &Path, hash: &str) {
        self.entries.insert(
            path.to_path_buf(),
            TrackedArtifact { last_hash: hash.to_string(), last_synced_at: Utc::now() },
        );
    }

    /// Forget every path not in `seen`; returns how many were dropped.
    pub fn retain_seen(&mut self, seen: &HashSet<PathBuf>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| seen.contains(path));
        before - self.entries.len()
    }

    pub fn get(&self, path: &Path) -> Option<&TrackedArtifact> { self.entries.get(path) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
