//! Authoritative commit → location index, persisted as JSON.
//!
//! Every mutation is saved with write-new-then-rename so a crash leaves
//! either the old or the new index on disk, never a partial one.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::domain::{ArtifactLocation, CommitId};

use super::digest::ArtifactDigest;
use super::{Result, StoreError};

/// File name of the index inside the store root.
pub const INDEX_FILE: &str = "index.json";

/// Current index format version.
const INDEX_FORMAT_VERSION: u32 = 1;

/// Location as persisted; raw paths are derived from the store root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredLocation {
    Raw,
    Bundled { bundle_id: String, index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub location: StoredLocation,
    pub digest: ArtifactDigest,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub commits: Vec<CommitId>,
    pub size_bytes: u64,
    pub sealed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreIndex {
    pub format_version: u32,
    pub entries: BTreeMap<CommitId, IndexEntry>,
    pub bundles: BTreeMap<String, BundleRecord>,
    /// Raw commits not yet bundled, in the order they were stored.
    pub pending: Vec<CommitId>,
}

impl Default for StoreIndex {
    fn default() -> Self {
        Self {
            format_version: INDEX_FORMAT_VERSION,
            entries: BTreeMap::new(),
            bundles: BTreeMap::new(),
            pending: Vec::new(),
        }
    }
}

impl StoreIndex {
    /// Load the index from `root`, or start empty if none exists yet.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(INDEX_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let index: StoreIndex = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: format!("unreadable index: {e}"),
        })?;
        if index.format_version != INDEX_FORMAT_VERSION {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("unsupported index version {}", index.format_version),
            });
        }
        Ok(index)
    }

    /// Atomically persist the index into `root`.
    pub fn save(&self, root: &Path) -> Result<()> {
        write_json_atomic(&root.join(INDEX_FILE), self)
    }

    /// Resolve the public location of `commit`.
    pub fn location(&self, root: &Path, commit: &CommitId) -> ArtifactLocation {
        match self.entries.get(commit).map(|e| &e.location) {
            Some(StoredLocation::Raw) => ArtifactLocation::Raw {
                path: raw_path(root, commit),
            },
            Some(StoredLocation::Bundled { bundle_id, index }) => ArtifactLocation::Bundled {
                bundle_id: bundle_id.clone(),
                index: *index,
            },
            None => ArtifactLocation::Absent,
        }
    }

    pub fn is_bundled(&self, commit: &CommitId) -> bool {
        matches!(
            self.entries.get(commit).map(|e| &e.location),
            Some(StoredLocation::Bundled { .. })
        )
    }
}

/// Directory holding the raw artifact of `commit`.
pub fn raw_path(root: &Path, commit: &CommitId) -> PathBuf {
    root.join(super::RAW_DIR).join(commit.as_str())
}

/// Serialize `value` next to `path` and rename it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(&bytes).map_err(|e| StoreError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}
