//! Commit-indexed artifact store.
//!
//! Artifacts live either raw (an uncompressed directory per commit) or
//! inside a sealed bundle. The JSON index under the store root is the single
//! source of truth for where each commit's artifact is; directory scans are
//! only used to find litter left behind by interrupted runs.
//!
//! Mutations (`store_raw`, `seal_group`, `deduplicate`, `evict_lru`,
//! `purge_loose_files`) are serialized by one writer lock. Lookups and
//! extractions run concurrently with them; a raw extraction holds the index
//! read lock for the duration of its copy so that deduplication cannot
//! delete the directory underneath it.

pub mod bundle;
pub mod digest;
pub mod index;
pub mod lists;
pub mod tree;
pub mod usage;

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{ArtifactLocation, BuildStatus, CommitId};
use crate::metrics::METRICS;
use crate::obs;

use self::bundle::{BundleSource, BUNDLE_EXT};
use self::digest::ArtifactDigest;
use self::index::{raw_path, BundleRecord, IndexEntry, StoreIndex, StoredLocation};
use self::lists::{read_commit_list, write_commit_list, CommitLists, COMPILE_ERROR_FILE};
use self::tree::{copy_file, copy_tree, move_path, replace_dir};
use self::usage::{select_evictions, UsageLog};

/// Raw artifact directories.
pub const RAW_DIR: &str = "raw";
/// Sealed bundles.
pub const BUNDLE_DIR: &str = "bundles";
/// Derived working copies, evictable.
pub const EXTRACT_DIR: &str = "extracted";

/// Prefix of in-progress staging directories; never a valid commit name.
const STAGING_PREFIX: &str = ".staging-";

/// Errors from artifact store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("commit not cached: {0}")]
    NotCached(CommitId),

    #[error("commit already present in store: {0}")]
    AlreadyPresent(CommitId),

    #[error("bundle already sealed: {0}")]
    BundleExists(String),

    #[error("cannot seal an empty bundle")]
    EmptyBundle,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("path escapes source root: {0}")]
    PathEscapesRoot(PathBuf),

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Disk or decompression failure, including lazily detected corruption.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, StoreError::Io { .. } | StoreError::Corrupt { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Read-only "is this commit cached?" view used by candidate selection.
pub trait ArtifactCatalog: Send + Sync {
    fn is_cached(&self, commit: &CommitId) -> bool;
}

impl ArtifactCatalog for HashSet<CommitId> {
    fn is_cached(&self, commit: &CommitId) -> bool {
        self.contains(commit)
    }
}

impl ArtifactCatalog for BTreeSet<CommitId> {
    fn is_cached(&self, commit: &CommitId) -> bool {
        self.contains(commit)
    }
}

/// Tunables for the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Move build output into the cache instead of copying it.
    pub move_on_store: bool,
    /// gzip level used when sealing bundles (0-9).
    pub compression_level: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            move_on_store: false,
            compression_level: 6,
        }
    }
}

/// Result of sealing one group of raw artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBundle {
    pub bundle_id: String,
    pub commits: Vec<CommitId>,
    pub size_bytes: u64,
    pub raw_removed: usize,
}

/// Durable commit → artifact mapping rooted at a directory.
pub struct ArtifactStore {
    root: PathBuf,
    options: StoreOptions,
    index: RwLock<StoreIndex>,
    writer: Mutex<()>,
    usage: Mutex<UsageLog>,
}

impl ArtifactStore {
    /// Open (or initialize) the store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in [RAW_DIR, BUNDLE_DIR, EXTRACT_DIR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        let index = StoreIndex::load(&root)?;
        let usage = UsageLog::load(&root)?;
        debug!(
            root = %root.display(),
            commits = index.entries.len(),
            bundles = index.bundles.len(),
            "opened artifact store"
        );
        Ok(Self {
            root,
            options,
            index: RwLock::new(index),
            writer: Mutex::new(()),
            usage: Mutex::new(usage),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_index(&self) -> RwLockReadGuard<'_, StoreIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, StoreIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_usage(&self) -> MutexGuard<'_, UsageLog> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bundle_path(&self, bundle_id: &str) -> PathBuf {
        self.root
            .join(BUNDLE_DIR)
            .join(format!("{bundle_id}.{BUNDLE_EXT}"))
    }

    pub fn working_copy_path(&self, commit: &CommitId) -> PathBuf {
        self.root.join(EXTRACT_DIR).join(commit.as_str())
    }

    /// Where the artifact for `commit` lives. Only reads the in-memory index.
    pub fn lookup(&self, commit: &CommitId) -> ArtifactLocation {
        self.read_index().location(&self.root, commit)
    }

    /// Every commit with an artifact, raw or bundled.
    pub fn present_commits(&self) -> BTreeSet<CommitId> {
        self.read_index().entries.keys().cloned().collect()
    }

    /// Raw commits waiting to be bundled, in store order.
    pub fn pending_bundle(&self) -> Vec<CommitId> {
        self.read_index().pending.clone()
    }

    /// Sealed bundle ids and their records.
    pub fn bundles(&self) -> Vec<(String, BundleRecord)> {
        self.read_index()
            .bundles
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn lists(&self) -> Result<CommitLists> {
        CommitLists::load(&self.root)
    }

    /// Full build status of `commit`, consulting the exclusion lists.
    pub fn status(&self, commit: &CommitId) -> Result<BuildStatus> {
        Ok(self.lists()?.status(commit, self.lookup(commit)))
    }

    /// Record classified compile errors. Returns how many were new.
    pub fn add_compile_errors(&self, commits: &[CommitId]) -> Result<usize> {
        let _writer = self.lock_writer();
        let path = self.root.join(COMPILE_ERROR_FILE);
        let mut list = read_commit_list(&path)?;
        let before = list.len();
        list.extend(commits.iter().cloned());
        let added = list.len() - before;
        if added > 0 {
            write_commit_list(&path, &list)?;
        }
        Ok(added)
    }

    /// Copy (or move) build output into the raw cache under `commit`.
    ///
    /// `paths` are files or directories relative to `source_root`; their
    /// layout below `source_root` is preserved. Fails with `AlreadyPresent`
    /// when the commit already has a location.
    pub fn store_raw(
        &self,
        commit: &CommitId,
        source_root: &Path,
        paths: &[PathBuf],
    ) -> Result<ArtifactDigest> {
        let _writer = self.lock_writer();
        if self.read_index().entries.contains_key(commit) {
            return Err(StoreError::AlreadyPresent(commit.clone()));
        }

        let raw_dir = self.root.join(RAW_DIR);
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&raw_dir)
            .map_err(|e| StoreError::io(&raw_dir, e))?;
        let base = source_root
            .canonicalize()
            .map_err(|e| StoreError::io(source_root, e))?;

        for path in paths {
            let src = base
                .join(path)
                .canonicalize()
                .map_err(|e| StoreError::io(&base.join(path), e))?;
            let rel = src
                .strip_prefix(&base)
                .map_err(|_| StoreError::PathEscapesRoot(path.clone()))?
                .to_path_buf();
            let dst = staging.path().join(&rel);
            let is_dir = src.is_dir();
            if rel.as_os_str().is_empty() {
                copy_tree(&src, staging.path())?;
            } else if self.options.move_on_store {
                move_path(&src, &dst)?;
            } else if is_dir {
                copy_tree(&src, &dst)?;
            } else {
                copy_file(&src, &dst)?;
            }
        }

        let digest = ArtifactDigest::of_tree(staging.path())?;
        let final_path = raw_path(&self.root, commit);
        if final_path.exists() {
            warn!(commit = %commit.short(), "replacing unindexed raw directory");
        }
        replace_dir(staging.path(), &final_path)?;

        {
            let mut index = self.write_index();
            index.entries.insert(
                commit.clone(),
                IndexEntry {
                    location: StoredLocation::Raw,
                    digest,
                    stored_at: Utc::now(),
                },
            );
            index.pending.push(commit.clone());
            if let Err(e) = index.save(&self.root) {
                index.entries.remove(commit);
                index.pending.retain(|c| c != commit);
                drop(index);
                let _ = fs::remove_dir_all(&final_path);
                return Err(e);
            }
        }

        METRICS.inc_artifacts_stored();
        info!(event = "store.raw", commit = %commit.short(), digest = %digest, "cached artifact");
        Ok(digest)
    }

    /// Produce a runnable copy of `commit`'s artifact at `destination`.
    ///
    /// The destination is replaced wholesale, so repeated calls are
    /// idempotent. Bundled artifacts are verified against their recorded
    /// digest; a mismatch or decompression error is reported, never repaired.
    pub fn extract(&self, commit: &CommitId, destination: &Path) -> Result<()> {
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| StoreError::io(&parent, e))?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&parent)
            .map_err(|e| StoreError::io(&parent, e))?;

        let bundled = {
            let index = self.read_index();
            let entry = index
                .entries
                .get(commit)
                .ok_or_else(|| StoreError::NotCached(commit.clone()))?;
            match &entry.location {
                StoredLocation::Raw => {
                    copy_tree(&raw_path(&self.root, commit), staging.path())?;
                    None
                }
                StoredLocation::Bundled { bundle_id, index } => {
                    Some((self.bundle_path(bundle_id), *index, entry.digest))
                }
            }
        };

        if let Some((bundle_path, slice, expected)) = bundled {
            let recorded = bundle::extract_slice(&bundle_path, slice, staging.path())?;
            let actual = ArtifactDigest::of_tree(staging.path())?;
            if recorded != expected || actual != expected {
                return Err(StoreError::Corrupt {
                    path: bundle_path,
                    reason: format!("digest mismatch for {commit}"),
                });
            }
        }

        replace_dir(staging.path(), destination)?;
        METRICS.inc_extractions();
        debug!(commit = %commit.short(), dest = %destination.display(), "extracted artifact");
        Ok(())
    }

    /// Extract into the reusable working copy for `commit`, if not already
    /// there, and mark it most recently used.
    pub fn extract_working_copy(&self, commit: &CommitId) -> Result<PathBuf> {
        if !self.lookup(commit).is_present() {
            return Err(StoreError::NotCached(commit.clone()));
        }
        let dest = self.working_copy_path(commit);
        {
            // Touch before extracting so a concurrent eviction keeps it.
            let mut usage = self.lock_usage();
            usage.touch(commit);
            usage.save(&self.root)?;
        }
        if dest.is_dir() {
            METRICS.inc_working_copy_hits();
            return Ok(dest);
        }
        self.extract(commit, &dest)?;
        Ok(dest)
    }

    /// Delete raw copies whose commit is already bundled.
    ///
    /// Returns the number of raw directories removed; a second call with no
    /// intervening store removes nothing.
    pub fn deduplicate(&self, protected: &HashSet<CommitId>) -> Result<usize> {
        let _writer = self.lock_writer();
        let raw_dir = self.root.join(RAW_DIR);
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&raw_dir).map_err(|e| StoreError::io(&raw_dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&raw_dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(commit) = CommitId::new(&name) {
                if !protected.contains(&commit) {
                    candidates.push(commit);
                }
            }
        }
        let removed = self.remove_bundled_raw(&candidates)?;
        if removed > 0 {
            info!(event = "store.deduplicate", removed, "removed raw duplicates");
        }
        Ok(removed)
    }

    /// Caller must hold the writer lock.
    fn remove_bundled_raw(&self, commits: &[CommitId]) -> Result<usize> {
        let mut removed = 0;
        for commit in commits {
            let path = raw_path(&self.root, commit);
            // Exclusive index access waits out any raw copy in progress.
            let index = self.write_index();
            if index.is_bundled(commit) && path.exists() {
                fs::remove_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
                removed += 1;
            }
        }
        METRICS.add_duplicates_removed(removed as u64);
        Ok(removed)
    }

    /// Compress `commits` (all currently raw, in the given order) into one
    /// new bundle, mark them bundled, then drop their raw copies.
    pub fn seal_group(&self, commits: &[CommitId]) -> Result<SealedBundle> {
        let _writer = self.lock_writer();
        let first = commits.first().ok_or(StoreError::EmptyBundle)?;
        let bundle_id = first.to_string();

        let sources = {
            let index = self.read_index();
            if index.bundles.contains_key(&bundle_id) {
                return Err(StoreError::BundleExists(bundle_id));
            }
            commits
                .iter()
                .map(|commit| match index.entries.get(commit) {
                    Some(entry) if entry.location == StoredLocation::Raw => Ok(BundleSource {
                        commit: commit.clone(),
                        dir: raw_path(&self.root, commit),
                        digest: entry.digest,
                    }),
                    Some(_) => Err(StoreError::AlreadyPresent(commit.clone())),
                    None => Err(StoreError::NotCached(commit.clone())),
                })
                .collect::<Result<Vec<_>>>()?
        };

        // An unreferenced file at this path is litter from an interrupted
        // seal; persisting over it is safe because no index entry points at it.
        let path = self.bundle_path(&bundle_id);
        let size_bytes =
            bundle::write_bundle(&path, &bundle_id, &sources, self.options.compression_level)?;

        {
            let mut index = self.write_index();
            let before = index.clone();
            for (slice, commit) in commits.iter().enumerate() {
                if let Some(entry) = index.entries.get_mut(commit) {
                    entry.location = StoredLocation::Bundled {
                        bundle_id: bundle_id.clone(),
                        index: slice,
                    };
                }
            }
            index.pending.retain(|c| !commits.contains(c));
            index.bundles.insert(
                bundle_id.clone(),
                BundleRecord {
                    commits: commits.to_vec(),
                    size_bytes,
                    sealed_at: Utc::now(),
                },
            );
            if let Err(e) = index.save(&self.root) {
                *index = before;
                drop(index);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        }

        let raw_removed = self.remove_bundled_raw(commits)?;
        METRICS.inc_bundles_sealed();
        obs::emit_bundle_sealed(&bundle_id, commits.len(), size_bytes);

        Ok(SealedBundle {
            bundle_id,
            commits: commits.to_vec(),
            size_bytes,
            raw_removed,
        })
    }

    /// Keep only the `keep` most recently used working copies.
    ///
    /// Only touches `extracted/`; authoritative raw and bundled artifacts are
    /// never deleted here.
    pub fn evict_lru(&self, keep: usize) -> Result<usize> {
        let _writer = self.lock_writer();
        let mut usage = self.lock_usage();
        let dir = self.root.join(EXTRACT_DIR);
        let mut present = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if let Ok(commit) = CommitId::new(entry.file_name().to_string_lossy()) {
                if entry.path().is_dir() {
                    present.push(commit);
                }
            }
        }

        let victims = select_evictions(&present, &usage, keep);
        for commit in &victims {
            let path = self.working_copy_path(commit);
            fs::remove_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
            usage.forget(commit);
        }
        usage.save(&self.root)?;

        if !victims.is_empty() {
            METRICS.add_evictions(victims.len() as u64);
            info!(event = "store.evict", evicted = victims.len(), keep, "evicted working copies");
        }
        Ok(victims.len())
    }

    /// Remove staging litter and files the index does not reference.
    pub fn purge_loose_files(&self) -> Result<usize> {
        let _writer = self.lock_writer();
        let index = self.read_index();
        let mut removed = 0;

        let raw_dir = self.root.join(RAW_DIR);
        for entry in fs::read_dir(&raw_dir).map_err(|e| StoreError::io(&raw_dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&raw_dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let known = CommitId::new(&name)
                .map(|c| index.entries.contains_key(&c))
                .unwrap_or(false);
            if !known {
                remove_any(&entry.path())?;
                removed += 1;
            }
        }

        let bundle_dir = self.root.join(BUNDLE_DIR);
        let live: HashSet<String> = index
            .bundles
            .keys()
            .map(|id| format!("{id}.{BUNDLE_EXT}"))
            .collect();
        for entry in fs::read_dir(&bundle_dir).map_err(|e| StoreError::io(&bundle_dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&bundle_dir, e))?;
            if !live.contains(entry.file_name().to_string_lossy().as_ref()) {
                remove_any(&entry.path())?;
                removed += 1;
            }
        }

        let extract_dir = self.root.join(EXTRACT_DIR);
        for entry in fs::read_dir(&extract_dir).map_err(|e| StoreError::io(&extract_dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&extract_dir, e))?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                remove_any(&entry.path())?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(event = "store.purge", removed, "removed loose files");
        }
        Ok(removed)
    }
}

fn remove_any(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| StoreError::io(path, e))
}

impl ArtifactCatalog for ArtifactStore {
    fn is_cached(&self, commit: &CommitId) -> bool {
        self.read_index().entries.contains_key(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(i: u32) -> CommitId {
        CommitId::new(format!("{i:08x}")).unwrap()
    }

    fn make_store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store"), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn build_output(dir: &Path, content: &str) -> PathBuf {
        let ws = dir.join(format!("ws-{content}"));
        fs::create_dir_all(ws.join("bin")).unwrap();
        fs::write(ws.join("bin/app"), content).unwrap();
        fs::write(ws.join("README"), "docs").unwrap();
        ws
    }

    #[test]
    fn lookup_unknown_is_absent() {
        let (_dir, store) = make_store();
        assert_eq!(store.lookup(&id(1)), ArtifactLocation::Absent);
        assert!(!store.is_cached(&id(1)));
    }

    #[test]
    fn store_raw_then_lookup_raw() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store
            .store_raw(&id(1), &ws, &[PathBuf::from("bin")])
            .unwrap();
        match store.lookup(&id(1)) {
            ArtifactLocation::Raw { path } => {
                assert_eq!(fs::read_to_string(path.join("bin/app")).unwrap(), "v1");
                assert!(!path.join("README").exists());
            }
            other => panic!("expected raw, got {other:?}"),
        }
        assert_eq!(store.pending_bundle(), vec![id(1)]);
    }

    #[test]
    fn double_store_is_already_present() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
        let err = store
            .store_raw(&id(1), &ws, &[PathBuf::from("bin")])
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyPresent(_)));
    }

    #[test]
    fn store_rejects_paths_outside_root() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        build_output(dir.path(), "other");
        let err = store
            .store_raw(&id(1), &ws, &[PathBuf::from("../ws-other/bin")])
            .unwrap_err();
        assert!(matches!(err, StoreError::PathEscapesRoot(_)));
        assert_eq!(store.lookup(&id(1)), ArtifactLocation::Absent);
    }

    #[test]
    fn move_on_store_consumes_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(
            dir.path().join("store"),
            StoreOptions {
                move_on_store: true,
                ..StoreOptions::default()
            },
        )
        .unwrap();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
        assert!(!ws.join("bin").exists());
        assert!(store.lookup(&id(1)).is_raw());
    }

    #[test]
    fn extract_missing_is_not_cached() {
        let (dir, store) = make_store();
        let err = store.extract(&id(9), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, StoreError::NotCached(_)));
    }

    #[test]
    fn extract_overwrites_destination() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale"), "old").unwrap();
        store.extract(&id(1), &out).unwrap();
        store.extract(&id(1), &out).unwrap();
        assert!(!out.join("stale").exists());
        assert_eq!(fs::read_to_string(out.join("bin/app")).unwrap(), "v1");
    }

    #[test]
    fn seal_group_moves_commits_into_bundle() {
        let (dir, store) = make_store();
        for i in 1..=3 {
            let ws = build_output(dir.path(), &format!("v{i}"));
            store.store_raw(&id(i), &ws, &[PathBuf::from("bin")]).unwrap();
        }
        let commits: Vec<CommitId> = (1..=3).map(id).collect();
        let sealed = store.seal_group(&commits).unwrap();
        assert_eq!(sealed.bundle_id, id(1).to_string());
        assert_eq!(sealed.raw_removed, 3);
        assert!(store.pending_bundle().is_empty());

        for (i, commit) in commits.iter().enumerate() {
            assert_eq!(
                store.lookup(commit),
                ArtifactLocation::Bundled {
                    bundle_id: sealed.bundle_id.clone(),
                    index: i
                }
            );
        }

        let out = dir.path().join("out2");
        store.extract(&id(2), &out).unwrap();
        assert_eq!(fs::read_to_string(out.join("bin/app")).unwrap(), "v2");
    }

    #[test]
    fn sealing_twice_is_rejected() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
        store.seal_group(&[id(1)]).unwrap();
        assert!(matches!(
            store.seal_group(&[id(1)]),
            Err(StoreError::BundleExists(_))
        ));
        assert!(matches!(
            store.seal_group(&[]),
            Err(StoreError::EmptyBundle)
        ));
    }

    #[test]
    fn deduplicate_removes_litter_and_is_idempotent() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
        store.seal_group(&[id(1)]).unwrap();

        // Simulate a raw copy left behind by an interrupted seal.
        let litter = raw_path(store.root(), &id(1));
        fs::create_dir_all(litter.join("bin")).unwrap();
        fs::write(litter.join("bin/app"), "v1").unwrap();

        let protected = HashSet::new();
        assert_eq!(store.deduplicate(&protected).unwrap(), 1);
        assert_eq!(store.deduplicate(&protected).unwrap(), 0);
        assert!(store.lookup(&id(1)).is_bundled());
    }

    #[test]
    fn deduplicate_respects_protected() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
        store.seal_group(&[id(1)]).unwrap();
        let litter = raw_path(store.root(), &id(1));
        fs::create_dir_all(&litter).unwrap();

        let protected = HashSet::from([id(1)]);
        assert_eq!(store.deduplicate(&protected).unwrap(), 0);
        assert!(litter.exists());
    }

    #[test]
    fn working_copies_are_evicted_lru() {
        let (dir, store) = make_store();
        for i in 1..=3 {
            let ws = build_output(dir.path(), &format!("v{i}"));
            store.store_raw(&id(i), &ws, &[PathBuf::from("bin")]).unwrap();
            store.extract_working_copy(&id(i)).unwrap();
        }
        // Use 1 again so that 2 is now the least recent.
        store.extract_working_copy(&id(1)).unwrap();

        assert_eq!(store.evict_lru(2).unwrap(), 1);
        assert!(!store.working_copy_path(&id(2)).exists());
        assert!(store.working_copy_path(&id(1)).exists());
        assert!(store.working_copy_path(&id(3)).exists());
        // Authoritative copy untouched.
        assert!(store.lookup(&id(2)).is_raw());
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        {
            let store = ArtifactStore::open(&root, StoreOptions::default()).unwrap();
            let ws = build_output(dir.path(), "v1");
            store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
            store.seal_group(&[id(1)]).unwrap();
        }
        let store = ArtifactStore::open(&root, StoreOptions::default()).unwrap();
        assert!(store.lookup(&id(1)).is_bundled());
        assert_eq!(store.bundles().len(), 1);
    }

    #[test]
    fn corrupted_bundle_is_reported_on_extract() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
        let sealed = store.seal_group(&[id(1)]).unwrap();
        fs::write(store.bundle_path(&sealed.bundle_id), b"garbage").unwrap();

        let err = store.extract(&id(1), &dir.path().join("out")).unwrap_err();
        assert!(err.is_io_failure());
        // No repair: the index still claims the bundle.
        assert!(store.lookup(&id(1)).is_bundled());
    }

    #[test]
    fn compile_errors_are_recorded_once() {
        let (_dir, store) = make_store();
        assert_eq!(store.add_compile_errors(&[id(1), id(2)]).unwrap(), 2);
        assert_eq!(store.add_compile_errors(&[id(2)]).unwrap(), 0);
        assert_eq!(store.status(&id(1)).unwrap(), BuildStatus::CompileError);
        assert_eq!(store.status(&id(3)).unwrap(), BuildStatus::Unbuilt);
    }

    #[test]
    fn purge_loose_files_keeps_indexed_entries() {
        let (dir, store) = make_store();
        let ws = build_output(dir.path(), "v1");
        store.store_raw(&id(1), &ws, &[PathBuf::from("bin")]).unwrap();
        fs::create_dir_all(store.root().join(RAW_DIR).join(".staging-abc")).unwrap();
        fs::create_dir_all(store.root().join(RAW_DIR).join("deadbeef")).unwrap();
        fs::write(store.root().join(BUNDLE_DIR).join("orphan.bundle"), b"x").unwrap();

        assert_eq!(store.purge_loose_files().unwrap(), 3);
        assert!(store.lookup(&id(1)).is_raw());
        assert!(raw_path(store.root(), &id(1)).exists());
    }
}
