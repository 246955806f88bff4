//! Commit graph capability.
//!
//! The bisection engine and bundle packer never talk to version control
//! directly. They consume a [`CommitGraph`], which must be deterministic for a
//! fixed underlying history. Ancestry queries are the hot path during
//! candidate selection, so [`CachedCommitGraph`] memoizes them explicitly
//! with a caller-controlled [`CachedCommitGraph::invalidate`].

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::domain::{CommitId, Result};

pub use memory::MemoryCommitGraph;

/// Read-only view of the commit history.
pub trait CommitGraph: Send + Sync {
    /// Resolve a reference (branch, tag, full or abbreviated hash) to a commit.
    fn resolve(&self, reference: &str) -> Result<CommitId>;

    /// Direct parents of `commit`, limited to the loaded history.
    fn parents(&self, commit: &CommitId) -> Result<Vec<CommitId>>;

    /// All strict ancestors of `commit`.
    fn ancestors(&self, commit: &CommitId) -> Result<HashSet<CommitId>>;

    /// All strict descendants of `commit`.
    fn descendants(&self, commit: &CommitId) -> Result<HashSet<CommitId>>;

    /// Sort `commits` into a stable topological order, oldest first.
    fn linear_order(&self, commits: &[CommitId]) -> Result<Vec<CommitId>>;

    /// Size estimate of the change between two commits.
    fn diff_size(&self, a: &CommitId, b: &CommitId) -> Result<u64>;
}

/// Memoizing wrapper around another [`CommitGraph`].
///
/// Only ancestry is cached; ordering and diff sizes are forwarded.
pub struct CachedCommitGraph<G> {
    inner: G,
    ancestors: Mutex<HashMap<CommitId, Arc<HashSet<CommitId>>>>,
    descendants: Mutex<HashMap<CommitId, Arc<HashSet<CommitId>>>>,
}

impl<G: CommitGraph> CachedCommitGraph<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            ancestors: Mutex::new(HashMap::new()),
            descendants: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    /// Drop every memoized answer, e.g. after the history was fetched again.
    pub fn invalidate(&self) {
        self.ancestors.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.descendants.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn memoized(
        cache: &Mutex<HashMap<CommitId, Arc<HashSet<CommitId>>>>,
        commit: &CommitId,
        compute: impl FnOnce() -> Result<HashSet<CommitId>>,
    ) -> Result<HashSet<CommitId>> {
        if let Some(hit) = cache.lock().unwrap_or_else(|e| e.into_inner()).get(commit) {
            return Ok(hit.as_ref().clone());
        }
        let value = Arc::new(compute()?);
        cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(commit.clone(), Arc::clone(&value));
        Ok(value.as_ref().clone())
    }
}

impl<G: CommitGraph> CommitGraph for CachedCommitGraph<G> {
    fn resolve(&self, reference: &str) -> Result<CommitId> {
        self.inner.resolve(reference)
    }

    fn parents(&self, commit: &CommitId) -> Result<Vec<CommitId>> {
        self.inner.parents(commit)
    }

    fn ancestors(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
        Self::memoized(&self.ancestors, commit, || self.inner.ancestors(commit))
    }

    fn descendants(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
        Self::memoized(&self.descendants, commit, || self.inner.descendants(commit))
    }

    fn linear_order(&self, commits: &[CommitId]) -> Result<Vec<CommitId>> {
        self.inner.linear_order(commits)
    }

    fn diff_size(&self, a: &CommitId, b: &CommitId) -> Result<u64> {
        self.inner.diff_size(a, b)
    }
}
