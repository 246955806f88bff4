//! Bulk compilation ahead of bisecting.
//!
//! A [`SamplingStrategy`] decides which uncached commits to build. The
//! [`Precompiler`] then compiles them one at a time, always choosing the
//! remaining commit with the smallest diff from the one just built so that
//! incremental builds stay cheap, and seals bundles as it goes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::builder::{failure_is_commit_specific, BuildOutcome, Builder, CompileGate};
use crate::domain::{CommitId, Result};
use crate::graph::CommitGraph;
use crate::metrics::METRICS;
use crate::obs;
use crate::packer::BundlePacker;
use crate::store::{ArtifactCatalog, ArtifactStore, SealedBundle};

/// Chooses which missing commits get compiled.
pub trait SamplingStrategy: Send + Sync {
    /// `commits` is the full range in history order; `missing` the subset
    /// that is neither cached nor excluded. Returns commits to build.
    fn select(
        &self,
        graph: &dyn CommitGraph,
        commits: &[CommitId],
        missing: &HashSet<CommitId>,
    ) -> Result<Vec<CommitId>>;
}

/// Every missing commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EverySample;

impl SamplingStrategy for EverySample {
    fn select(
        &self,
        _graph: &dyn CommitGraph,
        commits: &[CommitId],
        missing: &HashSet<CommitId>,
    ) -> Result<Vec<CommitId>> {
        Ok(commits
            .iter()
            .filter(|c| missing.contains(*c))
            .cloned()
            .collect())
    }
}

/// One commit out of every `n` consecutive missing ones.
///
/// A cached commit resets the count, so gaps are measured from the nearest
/// existing artifact rather than from the start of the range.
#[derive(Debug, Clone, Copy)]
pub struct EvenlySpaced {
    pub n: usize,
}

impl SamplingStrategy for EvenlySpaced {
    fn select(
        &self,
        _graph: &dyn CommitGraph,
        commits: &[CommitId],
        missing: &HashSet<CommitId>,
    ) -> Result<Vec<CommitId>> {
        let n = self.n.max(1);
        let mut run = 0;
        let mut selected = Vec::new();
        for commit in commits {
            if !missing.contains(commit) {
                run = 0;
                continue;
            }
            run += 1;
            if run >= n {
                selected.push(commit.clone());
                run = 0;
            }
        }
        Ok(selected)
    }
}

/// Missing commits ordered by the size of their change, largest first.
///
/// `limit` caps how many are returned.
#[derive(Debug, Clone, Copy)]
pub struct LargestDiffFirst {
    pub limit: Option<usize>,
}

impl SamplingStrategy for LargestDiffFirst {
    fn select(
        &self,
        graph: &dyn CommitGraph,
        commits: &[CommitId],
        missing: &HashSet<CommitId>,
    ) -> Result<Vec<CommitId>> {
        let mut sized = Vec::new();
        for (i, commit) in commits.iter().enumerate() {
            if !missing.contains(commit) {
                continue;
            }
            let size = match i.checked_sub(1) {
                Some(prev) => graph.diff_size(&commits[prev], commit)?,
                None => 0,
            };
            sized.push((size, i, commit.clone()));
        }
        sized.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(sized.into_iter().take(limit).map(|(_, _, c)| c).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompileOptions {
    pub bundle_size: usize,
    pub compile_error_threshold: usize,
    pub retry_compress: bool,
    /// Seal bundles during and after the run.
    pub compress: bool,
}

impl Default for PrecompileOptions {
    fn default() -> Self {
        Self {
            bundle_size: 20,
            compile_error_threshold: 3,
            retry_compress: true,
            compress: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecompileReport {
    pub compiled: Vec<CommitId>,
    pub failed: Vec<CommitId>,
    /// Failures recorded as commit-specific compile errors.
    pub classified: Vec<CommitId>,
    pub bundles: Vec<SealedBundle>,
    pub cancelled: bool,
}

pub struct Precompiler {
    store: Arc<ArtifactStore>,
    graph: Arc<dyn CommitGraph>,
    builder: Arc<dyn Builder>,
    gate: CompileGate,
    options: PrecompileOptions,
    cancel: Arc<AtomicBool>,
}

impl Precompiler {
    pub fn new(
        store: Arc<ArtifactStore>,
        graph: Arc<dyn CommitGraph>,
        builder: Arc<dyn Builder>,
        options: PrecompileOptions,
    ) -> Self {
        Self {
            store,
            graph,
            builder,
            gate: CompileGate::new(),
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_gate(mut self, gate: CompileGate) -> Self {
        self.gate = gate;
        self
    }

    /// Share a cancellation flag, e.g. one also seen by the builder.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag checked between compiles; set it to stop after the current one.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Compile what `strategy` picks out of `commits`.
    pub async fn run(
        &self,
        commits: &[CommitId],
        strategy: &dyn SamplingStrategy,
    ) -> Result<PrecompileReport> {
        let lists = self.store.lists()?.resolved(self.graph.as_ref());
        let ordered = self.graph.linear_order(commits)?;
        let missing: HashSet<CommitId> = ordered
            .iter()
            .filter(|c| !self.store.is_cached(c) && !lists.excludes(c))
            .cloned()
            .collect();
        let mut queue = strategy.select(self.graph.as_ref(), &ordered, &missing)?;
        info!(
            requested = commits.len(),
            missing = missing.len(),
            selected = queue.len(),
            "precompile starting"
        );

        let mut report = PrecompileReport::default();
        let mut previous: Option<CommitId> = None;
        while !queue.is_empty() {
            if self.cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }
            let next = match &previous {
                Some(prev) => most_similar(self.graph.as_ref(), prev, &queue)?,
                None => 0,
            };
            let commit = queue.remove(next);

            match self.gate.compile(self.builder.as_ref(), &commit).await {
                BuildOutcome::Success(artifact) => {
                    self.store
                        .store_raw(&commit, &artifact.source_root, &artifact.paths)?;
                    report.compiled.push(commit.clone());
                    if report.compiled.len() == self.options.compile_error_threshold {
                        self.classify_earlier_failures(&mut report)?;
                    }
                    if self.options.compress
                        && report.compiled.len() % (self.options.bundle_size * 2) == 0
                    {
                        self.pack(&mut report)?;
                    }
                }
                BuildOutcome::Failure { .. } => {
                    warn!(commit = %commit.short(), "compile failed, skipping");
                    let specific = failure_is_commit_specific(
                        report.compiled.len(),
                        self.options.compile_error_threshold,
                    );
                    obs::emit_compile_classified(&commit, report.compiled.len(), specific);
                    if specific {
                        self.store.add_compile_errors(std::slice::from_ref(&commit))?;
                        report.classified.push(commit.clone());
                    }
                    report.failed.push(commit.clone());
                }
                BuildOutcome::Aborted => {
                    report.cancelled = true;
                    break;
                }
            }
            previous = Some(commit);
        }

        if self.options.compress && !report.cancelled {
            self.pack(&mut report)?;
        }
        obs::emit_precompile_finished(
            report.compiled.len(),
            report.failed.len(),
            report.classified.len(),
        );
        METRICS.flush();
        Ok(report)
    }

    /// Once enough compiles succeeded, earlier failures are blamed on their
    /// commits too.
    fn classify_earlier_failures(&self, report: &mut PrecompileReport) -> Result<()> {
        let pending: Vec<CommitId> = report
            .failed
            .iter()
            .filter(|c| !report.classified.contains(c))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        warn!(
            count = pending.len(),
            "earlier compile failures are commit-specific, recording them"
        );
        self.store.add_compile_errors(&pending)?;
        report.classified.extend(pending);
        Ok(())
    }

    /// Seal full groups of what this run compiled.
    fn pack(&self, report: &mut PrecompileReport) -> Result<()> {
        let compiled: HashSet<&CommitId> = report.compiled.iter().collect();
        let pending: Vec<CommitId> = self
            .store
            .pending_bundle()
            .into_iter()
            .filter(|c| compiled.contains(c))
            .collect();
        let packer = BundlePacker::new(&self.store, self.graph.as_ref())
            .with_retry(self.options.retry_compress);
        let sealed = packer.seal(&pending, self.options.bundle_size)?;
        report.bundles.extend(sealed);
        Ok(())
    }
}

/// Queue entries compared per pick when ordering compiles by similarity.
const SIMILAR_WINDOW: usize = 8;

/// Index of the commit with the smallest diff from `previous` among the
/// next [`SIMILAR_WINDOW`] queued commits.
fn most_similar(graph: &dyn CommitGraph, previous: &CommitId, queue: &[CommitId]) -> Result<usize> {
    let mut best = (u64::MAX, 0);
    for (i, commit) in queue.iter().take(SIMILAR_WINDOW).enumerate() {
        let size = graph.diff_size(previous, commit)?;
        if size < best.0 {
            best = (size, i);
        }
    }
    Ok(best.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryCommitGraph;

    fn missing_of(ids: &[CommitId], idx: &[usize]) -> HashSet<CommitId> {
        idx.iter().map(|i| ids[*i].clone()).collect()
    }

    #[test]
    fn every_sample_keeps_history_order() {
        let (graph, ids) = MemoryCommitGraph::linear(5);
        let missing = missing_of(&ids, &[4, 1, 2]);
        let picked = EverySample.select(&graph, &ids, &missing).unwrap();
        assert_eq!(picked, vec![ids[1].clone(), ids[2].clone(), ids[4].clone()]);
    }

    #[test]
    fn evenly_spaced_resets_at_cached_commits() {
        let (graph, ids) = MemoryCommitGraph::linear(10);
        // 0..=3 missing, 4 cached, 5..=9 missing
        let missing = missing_of(&ids, &[0, 1, 2, 3, 5, 6, 7, 8, 9]);
        let picked = EvenlySpaced { n: 3 }.select(&graph, &ids, &missing).unwrap();
        assert_eq!(picked, vec![ids[2].clone(), ids[7].clone()]);

        let all = EvenlySpaced { n: 1 }.select(&graph, &ids, &missing).unwrap();
        assert_eq!(all.len(), 9);
    }

    #[test]
    fn largest_diff_first_orders_by_change_size() {
        let (mut graph, ids) = MemoryCommitGraph::linear(4);
        graph.set_diff_size(&ids[0], &ids[1], 5).unwrap();
        graph.set_diff_size(&ids[1], &ids[2], 50).unwrap();
        graph.set_diff_size(&ids[2], &ids[3], 10).unwrap();
        let missing = missing_of(&ids, &[1, 2, 3]);
        let picked = LargestDiffFirst { limit: Some(2) }
            .select(&graph, &ids, &missing)
            .unwrap();
        assert_eq!(picked, vec![ids[2].clone(), ids[3].clone()]);
    }

    #[test]
    fn similarity_only_looks_at_the_head_of_the_queue() {
        let (graph, ids) = MemoryCommitGraph::linear(20);
        // Newest first, so the closest commit to ids[0] sits at the very end.
        let queue: Vec<CommitId> = ids[1..].iter().rev().cloned().collect();
        let picked = most_similar(&graph, &ids[0], &queue).unwrap();
        assert_eq!(picked, SIMILAR_WINDOW - 1);
        assert_eq!(queue[picked], ids[12]);

        let short = &queue[15..];
        assert_eq!(most_similar(&graph, &ids[0], short).unwrap(), short.len() - 1);
    }
}
