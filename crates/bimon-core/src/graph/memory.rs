//! In-memory commit DAG.
//!
//! Used directly in tests and as the backing structure of the git-backed
//! graph, which loads `git rev-list --parents` output into it once.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{BimonError, CommitId, Result};

use super::CommitGraph;

/// Commit DAG held in memory, commits stored parents-first.
#[derive(Debug, Clone, Default)]
pub struct MemoryCommitGraph {
    commits: Vec<CommitId>,
    positions: HashMap<CommitId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    refs: HashMap<String, CommitId>,
    diff_sizes: HashMap<(usize, usize), u64>,
}

impl MemoryCommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear history of `len` synthetic commits, oldest first.
    pub fn linear(len: usize) -> (Self, Vec<CommitId>) {
        let mut graph = Self::new();
        let mut ids = Vec::with_capacity(len);
        for i in 0..len {
            let id = synthetic_id(i);
            let parents: Vec<CommitId> = ids.last().cloned().into_iter().collect();
            graph
                .add_commit(id.clone(), &parents)
                .unwrap_or_else(|_| unreachable!("linear parents always exist"));
            ids.push(id);
        }
        (graph, ids)
    }

    /// Register a commit. Parents unknown to the graph are ignored, which
    /// lets callers load a truncated window of history.
    pub fn add_commit(&mut self, id: CommitId, parents: &[CommitId]) -> Result<()> {
        if self.positions.contains_key(&id) {
            return Err(BimonError::GitError(format!("duplicate commit {id}")));
        }
        let pos = self.commits.len();
        let parent_positions: Vec<usize> = parents
            .iter()
            .filter_map(|p| self.positions.get(p).copied())
            .collect();
        for &p in &parent_positions {
            self.children[p].push(pos);
        }
        self.commits.push(id.clone());
        self.positions.insert(id, pos);
        self.parents.push(parent_positions);
        self.children.push(Vec::new());
        Ok(())
    }

    /// Name a commit so that [`CommitGraph::resolve`] accepts `name`.
    pub fn add_ref(&mut self, name: impl Into<String>, commit: CommitId) {
        self.refs.insert(name.into(), commit);
    }

    /// Override the diff size between two commits (symmetric).
    pub fn set_diff_size(&mut self, a: &CommitId, b: &CommitId, size: u64) -> Result<()> {
        let (pa, pb) = (self.position(a)?, self.position(b)?);
        self.diff_sizes.insert((pa.min(pb), pa.max(pb)), size);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn commits(&self) -> &[CommitId] {
        &self.commits
    }

    pub fn contains(&self, commit: &CommitId) -> bool {
        self.positions.contains_key(commit)
    }

    fn position(&self, commit: &CommitId) -> Result<usize> {
        self.positions
            .get(commit)
            .copied()
            .ok_or_else(|| BimonError::UnknownCommit(commit.to_string()))
    }

    fn walk(&self, start: usize, edges: &[Vec<usize>]) -> HashSet<CommitId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = edges[start].iter().copied().collect();
        while let Some(pos) = queue.pop_front() {
            if seen.insert(pos) {
                queue.extend(edges[pos].iter().copied());
            }
        }
        seen.into_iter().map(|p| self.commits[p].clone()).collect()
    }
}

/// Deterministic hex id for the `i`th synthetic commit.
pub fn synthetic_id(i: usize) -> CommitId {
    CommitId::new(format!("c0ffee{i:06x}"))
        .unwrap_or_else(|_| unreachable!("synthetic ids are valid hex"))
}

impl CommitGraph for MemoryCommitGraph {
    fn resolve(&self, reference: &str) -> Result<CommitId> {
        if let Some(id) = self.refs.get(reference) {
            return Ok(id.clone());
        }
        let lower = reference.trim().to_ascii_lowercase();
        let mut matches = self
            .commits
            .iter()
            .filter(|c| c.as_str().starts_with(&lower));
        match (matches.next(), matches.next()) {
            (Some(found), None) if !lower.is_empty() => Ok(found.clone()),
            _ => Err(BimonError::UnknownCommit(reference.to_string())),
        }
    }

    fn parents(&self, commit: &CommitId) -> Result<Vec<CommitId>> {
        let pos = self.position(commit)?;
        Ok(self.parents[pos]
            .iter()
            .map(|&p| self.commits[p].clone())
            .collect())
    }

    fn ancestors(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
        let pos = self.position(commit)?;
        Ok(self.walk(pos, &self.parents))
    }

    fn descendants(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
        let pos = self.position(commit)?;
        Ok(self.walk(pos, &self.children))
    }

    fn linear_order(&self, commits: &[CommitId]) -> Result<Vec<CommitId>> {
        let mut positioned = commits
            .iter()
            .map(|c| self.position(c).map(|p| (p, c.clone())))
            .collect::<Result<Vec<_>>>()?;
        positioned.sort_by_key(|(p, _)| *p);
        positioned.dedup_by_key(|(p, _)| *p);
        Ok(positioned.into_iter().map(|(_, c)| c).collect())
    }

    fn diff_size(&self, a: &CommitId, b: &CommitId) -> Result<u64> {
        let (pa, pb) = (self.position(a)?, self.position(b)?);
        let key = (pa.min(pb), pa.max(pb));
        Ok(self
            .diff_sizes
            .get(&key)
            .copied()
            .unwrap_or((key.1 - key.0) as u64))
    }
}
