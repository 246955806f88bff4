//! Groups accumulated raw artifacts into sealed bundles in history order.

use tracing::{debug, warn};

use crate::domain::{BimonError, CommitId, Result};
use crate::graph::CommitGraph;
use crate::store::{ArtifactStore, SealedBundle};

/// Seals pending raw artifacts into immutable compressed bundles.
pub struct BundlePacker<'a> {
    store: &'a ArtifactStore,
    graph: &'a dyn CommitGraph,
    retry: bool,
}

impl<'a> BundlePacker<'a> {
    pub fn new(store: &'a ArtifactStore, graph: &'a dyn CommitGraph) -> Self {
        Self {
            store,
            graph,
            retry: false,
        }
    }

    /// Retry a bundle once after an I/O failure before giving up.
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Seal every full group of `target_size` commits from `pending`.
    ///
    /// Leftover commits stay raw until more arrive or [`force_seal`] runs.
    ///
    /// [`force_seal`]: BundlePacker::force_seal
    pub fn seal(&self, pending: &[CommitId], target_size: usize) -> Result<Vec<SealedBundle>> {
        self.seal_groups(pending, target_size, false)
    }

    /// Like [`BundlePacker::seal`], but an undersized final group is sealed too.
    pub fn force_seal(
        &self,
        pending: &[CommitId],
        target_size: usize,
    ) -> Result<Vec<SealedBundle>> {
        self.seal_groups(pending, target_size, true)
    }

    /// Seal whatever the store currently lists as pending.
    pub fn seal_pending(&self, target_size: usize, force: bool) -> Result<Vec<SealedBundle>> {
        let pending = self.store.pending_bundle();
        self.seal_groups(&pending, target_size, force)
    }

    fn seal_groups(
        &self,
        pending: &[CommitId],
        target_size: usize,
        force: bool,
    ) -> Result<Vec<SealedBundle>> {
        if target_size == 0 {
            return Err(BimonError::Config("bundle size must be at least 1".into()));
        }
        let ordered = self.graph.linear_order(pending)?;
        let mut sealed = Vec::new();
        for group in ordered.chunks(target_size) {
            if group.len() < target_size && !force {
                debug!(left_raw = group.len(), target_size, "partial group left pending");
                break;
            }
            sealed.push(self.seal_with_retry(group)?);
        }
        Ok(sealed)
    }

    /// Seal one group, retrying once on I/O failure when enabled.
    pub fn seal_with_retry(&self, group: &[CommitId]) -> Result<SealedBundle> {
        match self.store.seal_group(group) {
            Err(e) if self.retry && e.is_io_failure() => {
                warn!(error = %e, commits = group.len(), "bundle failed, retrying once");
                Ok(self.store.seal_group(group)?)
            }
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::graph::MemoryCommitGraph;
    use crate::store::StoreOptions;

    fn setup(n: usize) -> (tempfile::TempDir, ArtifactStore, MemoryCommitGraph, Vec<CommitId>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store"), StoreOptions::default()).unwrap();
        let (graph, ids) = MemoryCommitGraph::linear(n);
        (dir, store, graph, ids)
    }

    fn store_commit(dir: &tempfile::TempDir, store: &ArtifactStore, commit: &CommitId) {
        let ws = dir.path().join(format!("ws-{commit}"));
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("app"), commit.as_str()).unwrap();
        store.store_raw(commit, &ws, &[PathBuf::from("app")]).unwrap();
    }

    #[test]
    fn seal_only_takes_full_groups_in_history_order() {
        let (dir, store, graph, ids) = setup(5);
        // Store out of order; bundles still follow history.
        for i in [3, 0, 4, 1, 2] {
            store_commit(&dir, &store, &ids[i]);
        }
        let packer = BundlePacker::new(&store, &graph);
        let sealed = packer.seal(&store.pending_bundle(), 2).unwrap();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].commits, vec![ids[0].clone(), ids[1].clone()]);
        assert_eq!(sealed[1].commits, vec![ids[2].clone(), ids[3].clone()]);
        assert_eq!(store.pending_bundle(), vec![ids[4].clone()]);
    }

    #[test]
    fn force_seal_includes_remainder() {
        let (dir, store, graph, ids) = setup(3);
        for id in &ids {
            store_commit(&dir, &store, id);
        }
        let packer = BundlePacker::new(&store, &graph);
        let sealed = packer.seal_pending(2, true).unwrap();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[1].commits, vec![ids[2].clone()]);
        assert!(store.pending_bundle().is_empty());
    }

    #[test]
    fn zero_bundle_size_is_rejected() {
        let (_dir, store, graph, _ids) = setup(1);
        let packer = BundlePacker::new(&store, &graph);
        assert!(matches!(packer.seal(&[], 0), Err(BimonError::Config(_))));
    }

    #[test]
    fn nothing_pending_seals_nothing() {
        let (_dir, store, graph, _ids) = setup(2);
        let packer = BundlePacker::new(&store, &graph).with_retry(true);
        assert!(packer.seal_pending(2, true).unwrap().is_empty());
    }
}
