//! Cache-aware bisection state machine.
//!
//! The engine owns the good/bad/skip marks and derives everything else
//! from them: the candidate range is recomputed after every mark, and the
//! next pick is a pure function of the marks, the exclusion set and which
//! candidates the catalog reports as cached. Identical mark histories
//! therefore always produce identical picks.
//!
//! While some candidate in range is cached the engine stays in
//! [`Phase::Narrowing`] and only picks cached commits. Once none are left it
//! moves to [`Phase::Resolving`] and picks from everything, which means the
//! caller has to compile. It moves back if cached commits re-enter the pool.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::automation::{AutomationPolicy, ProcessOutcome};
use super::session::SessionMarks;
use crate::builder::failure_is_commit_specific;
use crate::domain::{BuildStatus, CommitId, Mark, Result};
use crate::graph::CommitGraph;
use crate::metrics::METRICS;
use crate::obs;
use crate::store::ArtifactCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Keep ignored and compile-error commits in the candidate range.
    pub include_unbuildable: bool,
    /// Stop instead of entering the resolving phase.
    pub cache_only: bool,
    /// Successful compiles needed before a failure counts as commit-specific.
    pub compile_error_threshold: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            include_unbuildable: false,
            cache_only: false,
            compile_error_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingSeed,
    Narrowing,
    Resolving,
    Done,
    Contradiction,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AwaitingSeed => "awaiting_seed",
            Phase::Narrowing => "narrowing",
            Phase::Resolving => "resolving",
            Phase::Done => "done",
            Phase::Contradiction => "contradiction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkWarning {
    /// The commit was not in the candidate range when marked.
    OutsideRange(CommitId),
    Relabelled {
        commit: CommitId,
        from: Mark,
        to: Mark,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPick {
    Test { commit: CommitId, cached: bool },
    /// The range is down to one known-bad commit.
    Done(CommitId),
    /// Cache-only session and no cached candidate is left.
    CacheExhausted { remaining: Vec<CommitId> },
    /// Nothing is left to test but more than one commit could be the
    /// culprit; `remaining` lists them, skipped and unbuildable included.
    Exhausted { remaining: Vec<CommitId> },
    NeedsSeed,
    Contradiction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceResult {
    Marked {
        mark: Mark,
        warnings: Vec<MarkWarning>,
    },
    NeedsManualInput,
}

/// Final state of a session, enough to resume it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub phase: Phase,
    pub good: Vec<CommitId>,
    pub bad: Vec<CommitId>,
    pub skip: Vec<CommitId>,
    /// Commits that could still be the culprit, in history order.
    pub remaining: Vec<CommitId>,
    pub culprit: Option<CommitId>,
    pub discarded: bool,
}

impl SessionReport {
    /// Command-line arguments that restart the search from this point.
    pub fn resume_hint(&self) -> String {
        let mut parts = Vec::new();
        for commit in &self.good {
            parts.push(format!("--good {}", commit.short()));
        }
        for commit in &self.bad {
            parts.push(format!("--bad {}", commit.short()));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct BisectEngine {
    options: EngineOptions,
    good: BTreeSet<CommitId>,
    bad: BTreeSet<CommitId>,
    skip: BTreeSet<CommitId>,
    excluded: BTreeSet<CommitId>,
    /// Every commit consistent with the good/bad marks, in history order.
    suspects: Vec<CommitId>,
    /// `suspects` minus skipped and excluded commits.
    range: Vec<CommitId>,
    phase: Phase,
    contradiction: Option<String>,
}

impl BisectEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            good: BTreeSet::new(),
            bad: BTreeSet::new(),
            skip: BTreeSet::new(),
            excluded: BTreeSet::new(),
            suspects: Vec::new(),
            range: Vec::new(),
            phase: Phase::AwaitingSeed,
            contradiction: None,
        }
    }

    /// Commits never to pick automatically (ignored list and classified
    /// compile errors).
    pub fn with_excluded(mut self, excluded: impl IntoIterator<Item = CommitId>) -> Self {
        self.excluded = excluded.into_iter().collect();
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Candidate range in history order.
    pub fn range(&self) -> &[CommitId] {
        &self.range
    }

    /// Commits that could still be the first bad one, including skipped
    /// and unbuildable commits the range leaves out.
    pub fn suspects(&self) -> &[CommitId] {
        &self.suspects
    }

    pub fn contradiction(&self) -> Option<&str> {
        self.contradiction.as_deref()
    }

    pub fn label_of(&self, commit: &CommitId) -> Option<Mark> {
        if self.good.contains(commit) {
            Some(Mark::Good)
        } else if self.bad.contains(commit) {
            Some(Mark::Bad)
        } else if self.skip.contains(commit) {
            Some(Mark::Skip)
        } else {
            None
        }
    }

    pub fn marks(&self) -> SessionMarks {
        SessionMarks {
            good: self.good.clone(),
            bad: self.bad.clone(),
            skip: self.skip.clone(),
        }
    }

    /// Replace all marks at once, e.g. when resuming a saved session.
    pub fn restore(&mut self, graph: &dyn CommitGraph, marks: &SessionMarks) -> Result<()> {
        let mut next = self.clone();
        next.good = marks.good.clone();
        next.bad = marks.bad.clone();
        next.skip = marks.skip.clone();
        next.recompute(graph)?;
        *self = next;
        Ok(())
    }

    /// Label `commit`. Relabelling moves it between sets.
    ///
    /// The engine state is unchanged if the graph cannot place the commit.
    pub fn mark(
        &mut self,
        graph: &dyn CommitGraph,
        commit: &CommitId,
        mark: Mark,
    ) -> Result<Vec<MarkWarning>> {
        let mut warnings = Vec::new();
        match self.label_of(commit) {
            Some(previous) if previous != mark => warnings.push(MarkWarning::Relabelled {
                commit: commit.clone(),
                from: previous,
                to: mark,
            }),
            Some(_) => {}
            None if self.has_range() && !self.suspects.contains(commit) => {
                warnings.push(MarkWarning::OutsideRange(commit.clone()))
            }
            None => {}
        }

        let mut next = self.clone();
        next.remove_marks(commit);
        match mark {
            Mark::Good => next.good.insert(commit.clone()),
            Mark::Bad => next.bad.insert(commit.clone()),
            Mark::Skip => next.skip.insert(commit.clone()),
        };
        next.recompute(graph)?;
        *self = next;
        Ok(warnings)
    }

    /// Remove any mark on `commit`. Returns whether it had one.
    pub fn unmark(&mut self, graph: &dyn CommitGraph, commit: &CommitId) -> Result<bool> {
        if self.label_of(commit).is_none() {
            return Ok(false);
        }
        let mut next = self.clone();
        next.remove_marks(commit);
        next.recompute(graph)?;
        *self = next;
        Ok(true)
    }

    fn remove_marks(&mut self, commit: &CommitId) {
        self.good.remove(commit);
        self.bad.remove(commit);
        self.skip.remove(commit);
    }

    fn has_range(&self) -> bool {
        matches!(
            self.phase,
            Phase::Narrowing | Phase::Resolving | Phase::Done
        )
    }

    fn contradict(&mut self, reason: String) {
        self.suspects.clear();
        self.range.clear();
        self.phase = Phase::Contradiction;
        self.contradiction = Some(reason);
    }

    fn recompute(&mut self, graph: &dyn CommitGraph) -> Result<()> {
        let previous = self.phase;
        self.contradiction = None;
        self.suspects.clear();
        self.range.clear();

        if self.good.is_empty() || self.bad.is_empty() {
            self.phase = Phase::AwaitingSeed;
            return Ok(());
        }
        if let Some(commit) = self.good.intersection(&self.bad).next() {
            let reason = format!("{commit} is marked both good and bad");
            self.contradict(reason);
            return Ok(());
        }

        let mut candidates: Option<HashSet<CommitId>> = None;
        for bad in &self.bad {
            let mut side = graph.ancestors(bad)?;
            side.insert(bad.clone());
            candidates = Some(match candidates {
                None => side,
                Some(acc) => acc.intersection(&side).cloned().collect(),
            });
        }
        let mut candidates = candidates.unwrap_or_default();
        for good in &self.good {
            let descendants = graph.descendants(good)?;
            candidates.retain(|c| descendants.contains(c));
        }

        if candidates.is_empty() {
            let reason = self.explain_empty(graph)?;
            self.contradict(reason);
            return Ok(());
        }

        let candidates: Vec<CommitId> = candidates.into_iter().collect();
        self.suspects = graph.linear_order(&candidates)?;
        self.range = self
            .suspects
            .iter()
            .filter(|c| self.is_testable(c))
            .cloned()
            .collect();
        self.phase = match previous {
            Phase::Resolving => Phase::Resolving,
            _ => Phase::Narrowing,
        };
        self.settle();
        Ok(())
    }

    fn explain_empty(&self, graph: &dyn CommitGraph) -> Result<String> {
        for good in &self.good {
            let ancestors = graph.ancestors(good)?;
            for bad in &self.bad {
                if ancestors.contains(bad) {
                    return Ok(format!(
                        "bad {} is an ancestor of good {}",
                        bad.short(),
                        good.short()
                    ));
                }
            }
        }
        Ok("no commit descends from every good commit and precedes every bad commit".into())
    }

    fn is_testable(&self, commit: &CommitId) -> bool {
        !self.skip.contains(commit)
            && (self.options.include_unbuildable || !self.excluded.contains(commit))
    }

    /// Enter `Done` when the known-bad commit is the only suspect left.
    fn settle(&mut self) {
        if self.suspects.len() == 1 && self.bad.contains(&self.suspects[0]) {
            self.phase = Phase::Done;
        }
    }

    fn test_points(&self) -> Vec<CommitId> {
        self.range
            .iter()
            .filter(|c| !self.bad.contains(*c))
            .cloned()
            .collect()
    }

    /// Choose the next commit to test.
    ///
    /// Among eligible candidates, picks the one whose worst-case outcome
    /// leaves the smallest range; ties go to the oldest in history order.
    pub fn next_candidate(
        &mut self,
        graph: &dyn CommitGraph,
        catalog: &dyn ArtifactCatalog,
    ) -> Result<NextPick> {
        match self.phase {
            Phase::AwaitingSeed => return Ok(NextPick::NeedsSeed),
            Phase::Contradiction => {
                return Ok(NextPick::Contradiction(
                    self.contradiction.clone().unwrap_or_default(),
                ))
            }
            Phase::Done => return Ok(NextPick::Done(self.suspects[0].clone())),
            Phase::Narrowing | Phase::Resolving => {}
        }

        let points = self.test_points();
        if points.is_empty() {
            return Ok(NextPick::Exhausted {
                remaining: self.suspects.clone(),
            });
        }

        let cached: Vec<CommitId> = points
            .iter()
            .filter(|c| catalog.is_cached(c))
            .cloned()
            .collect();
        let pool = if cached.is_empty() {
            if self.phase == Phase::Narrowing {
                if self.options.cache_only {
                    return Ok(NextPick::CacheExhausted {
                        remaining: self.suspects.clone(),
                    });
                }
                self.set_phase(Phase::Resolving);
            }
            points
        } else {
            if self.phase == Phase::Resolving {
                self.set_phase(Phase::Narrowing);
            }
            cached
        };

        let is_cached = self.phase == Phase::Narrowing;
        let commit = self.most_balanced(graph, &pool)?;
        if is_cached {
            METRICS.inc_cached_picks();
        }
        obs::emit_candidate_picked(&commit, is_cached, self.range.len());
        Ok(NextPick::Test {
            commit,
            cached: is_cached,
        })
    }

    fn set_phase(&mut self, phase: Phase) {
        obs::emit_phase_changed(self.phase.as_str(), phase.as_str());
        self.phase = phase;
    }

    /// Pick from `pool` the commit whose worse outcome leaves the fewest
    /// range commits.
    ///
    /// Marking `c` bad keeps the range commits that are `c` or its
    /// ancestors; marking it good keeps its descendants. Both counts come
    /// from one pass over the suspects in history order. Suspects form a
    /// convex slice of history, so a commit with a single parent (or child)
    /// inside it extends that one's count by itself; only merges and forks
    /// need a walk.
    fn most_balanced(&self, graph: &dyn CommitGraph, pool: &[CommitId]) -> Result<CommitId> {
        let index: HashMap<&CommitId, usize> = self
            .suspects
            .iter()
            .enumerate()
            .map(|(i, c)| (c, i))
            .collect();
        let n = self.suspects.len();
        let mut parents: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, commit) in self.suspects.iter().enumerate() {
            let inside: Vec<usize> = graph
                .parents(commit)?
                .iter()
                .filter_map(|p| index.get(p).copied())
                .collect();
            for &p in &inside {
                children[p].push(i);
            }
            parents.push(inside);
        }
        let in_range: HashSet<&CommitId> = self.range.iter().collect();
        let weight: Vec<usize> = self
            .suspects
            .iter()
            .map(|c| usize::from(in_range.contains(c)))
            .collect();

        let mut up = vec![0usize; n];
        for i in 0..n {
            up[i] = match parents[i].as_slice() {
                [] => weight[i],
                [p] => up[*p] + weight[i],
                _ => reach_weight(i, &parents, &weight),
            };
        }
        let mut down = vec![0usize; n];
        for i in (0..n).rev() {
            down[i] = match children[i].as_slice() {
                [] => weight[i],
                [c] => down[*c] + weight[i],
                _ => reach_weight(i, &children, &weight),
            };
        }

        let mut best: Option<(usize, &CommitId)> = None;
        for commit in pool {
            let Some(&i) = index.get(commit) else {
                continue;
            };
            let bad_side = up[i];
            let good_side = down[i] - weight[i];
            let score = bad_side.max(good_side);
            if best.map_or(true, |(s, _)| score < s) {
                best = Some((score, commit));
            }
        }
        // pool is never empty here
        Ok(best.map(|(_, c)| c.clone()).unwrap_or_else(|| pool[0].clone()))
    }

    /// Decide what a failed compile of `commit` means.
    ///
    /// With at least `compile_error_threshold` successful compiles behind
    /// it, the failure is blamed on the commit: it is excluded from further
    /// automatic picks and `CompileError` is returned for the caller to
    /// persist. Otherwise it is treated as environmental and `Unbuilt` is
    /// returned without changing anything.
    pub fn classify_compile_failure(
        &mut self,
        commit: &CommitId,
        prior_success_count: usize,
    ) -> BuildStatus {
        let classified =
            failure_is_commit_specific(prior_success_count, self.options.compile_error_threshold);
        obs::emit_compile_classified(commit, prior_success_count, classified);
        if !classified {
            return BuildStatus::Unbuilt;
        }
        self.excluded.insert(commit.clone());
        if !self.options.include_unbuildable {
            self.range.retain(|c| c != commit);
            self.settle();
        }
        BuildStatus::CompileError
    }

    /// Apply `policy` to the outcome of testing `commit`.
    pub fn advance(
        &mut self,
        graph: &dyn CommitGraph,
        commit: &CommitId,
        outcome: &ProcessOutcome,
        policy: &AutomationPolicy,
    ) -> Result<AdvanceResult> {
        match policy.evaluate(outcome) {
            Some(mark) => {
                let warnings = self.mark(graph, commit, mark)?;
                obs::emit_marked(commit, mark, true);
                Ok(AdvanceResult::Marked { mark, warnings })
            }
            None => Ok(AdvanceResult::NeedsManualInput),
        }
    }

    /// Cached commits that could be picked after up to `depth` more
    /// good/bad outcomes, with higher priority for nearer ones.
    ///
    /// The current pick itself is not included.
    pub fn speculative_candidates(
        &self,
        graph: &dyn CommitGraph,
        catalog: &dyn ArtifactCatalog,
        depth: usize,
    ) -> Result<Vec<(CommitId, u32)>> {
        let mut found = Vec::new();
        if depth > 0 {
            self.explore(graph, catalog, 1, depth, &mut found)?;
        }
        Ok(found)
    }

    fn explore(
        &self,
        graph: &dyn CommitGraph,
        catalog: &dyn ArtifactCatalog,
        level: usize,
        depth: usize,
        found: &mut Vec<(CommitId, u32)>,
    ) -> Result<()> {
        let mut ahead = self.clone();
        let NextPick::Test { commit, .. } = ahead.next_candidate(graph, catalog)? else {
            return Ok(());
        };
        let priority = (depth + 1 - level) as u32;
        for mark in [Mark::Bad, Mark::Good] {
            let mut branch = ahead.clone();
            branch.mark(graph, &commit, mark)?;
            if let NextPick::Test {
                commit: next,
                cached: true,
            } = branch.clone().next_candidate(graph, catalog)?
            {
                match found.iter_mut().find(|(c, _)| *c == next) {
                    Some(entry) => entry.1 = entry.1.max(priority),
                    None => found.push((next, priority)),
                }
            }
            if level < depth {
                branch.explore(graph, catalog, level + 1, depth, found)?;
            }
        }
        Ok(())
    }

    pub fn close(&self, discard: bool) -> SessionReport {
        SessionReport {
            phase: self.phase,
            good: self.good.iter().cloned().collect(),
            bad: self.bad.iter().cloned().collect(),
            skip: self.skip.iter().cloned().collect(),
            remaining: self.suspects.clone(),
            culprit: (self.phase == Phase::Done).then(|| self.suspects[0].clone()),
            discarded: discard,
        }
    }
}

/// Total weight of `start` and everything reachable from it along `edges`.
fn reach_weight(start: usize, edges: &[Vec<usize>], weight: &[usize]) -> usize {
    let mut seen = vec![false; edges.len()];
    let mut stack = vec![start];
    let mut total = 0;
    seen[start] = true;
    while let Some(i) = stack.pop() {
        total += weight[i];
        for &next in &edges[i] {
            if !seen[next] {
                seen[next] = true;
                stack.push(next);
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::bisect::automation::{AutomationRule, OutcomeMatcher};
    use crate::graph::memory::synthetic_id;
    use crate::graph::MemoryCommitGraph;

    /// Counts ancestry queries, which cost a history walk each on git.
    struct CountingGraph {
        inner: MemoryCommitGraph,
        walks: AtomicUsize,
    }

    impl CommitGraph for CountingGraph {
        fn resolve(&self, reference: &str) -> Result<CommitId> {
            self.inner.resolve(reference)
        }
        fn parents(&self, commit: &CommitId) -> Result<Vec<CommitId>> {
            self.inner.parents(commit)
        }
        fn ancestors(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
            self.walks.fetch_add(1, Ordering::SeqCst);
            self.inner.ancestors(commit)
        }
        fn descendants(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
            self.walks.fetch_add(1, Ordering::SeqCst);
            self.inner.descendants(commit)
        }
        fn linear_order(&self, commits: &[CommitId]) -> Result<Vec<CommitId>> {
            self.inner.linear_order(commits)
        }
        fn diff_size(&self, a: &CommitId, b: &CommitId) -> Result<u64> {
            self.inner.diff_size(a, b)
        }
    }

    fn seeded(n: usize) -> (MemoryCommitGraph, Vec<CommitId>, BisectEngine) {
        let (graph, ids) = MemoryCommitGraph::linear(n);
        let mut engine = BisectEngine::new(EngineOptions::default());
        engine.mark(&graph, &ids[0], Mark::Good).unwrap();
        engine.mark(&graph, &ids[n - 1], Mark::Bad).unwrap();
        (graph, ids, engine)
    }

    #[test]
    fn awaits_seed_until_good_and_bad() {
        let (graph, ids) = MemoryCommitGraph::linear(4);
        let mut engine = BisectEngine::new(EngineOptions::default());
        let none: HashSet<CommitId> = HashSet::new();
        assert_eq!(engine.next_candidate(&graph, &none).unwrap(), NextPick::NeedsSeed);
        engine.mark(&graph, &ids[3], Mark::Bad).unwrap();
        assert_eq!(engine.phase(), Phase::AwaitingSeed);
        engine.mark(&graph, &ids[0], Mark::Good).unwrap();
        assert_eq!(engine.phase(), Phase::Narrowing);
        assert_eq!(engine.range(), &ids[1..]);
    }

    #[test]
    fn range_excludes_skipped_and_unbuildable() {
        let (graph, ids) = MemoryCommitGraph::linear(6);
        let mut engine =
            BisectEngine::new(EngineOptions::default()).with_excluded([ids[2].clone()]);
        engine.mark(&graph, &ids[0], Mark::Good).unwrap();
        engine.mark(&graph, &ids[5], Mark::Bad).unwrap();
        engine.mark(&graph, &ids[3], Mark::Skip).unwrap();
        assert_eq!(
            engine.range(),
            &[ids[1].clone(), ids[4].clone(), ids[5].clone()]
        );

        let mut inclusive = BisectEngine::new(EngineOptions {
            include_unbuildable: true,
            ..EngineOptions::default()
        })
        .with_excluded([ids[2].clone()]);
        inclusive.mark(&graph, &ids[0], Mark::Good).unwrap();
        inclusive.mark(&graph, &ids[5], Mark::Bad).unwrap();
        assert!(inclusive.range().contains(&ids[2]));
    }

    #[test]
    fn relabel_and_outside_range_warnings() {
        let (graph, ids, mut engine) = seeded(8);
        let warnings = engine.mark(&graph, &ids[4], Mark::Good).unwrap();
        assert!(warnings.is_empty());
        // ids[2] is now an ancestor of a good commit, outside the range.
        let warnings = engine.mark(&graph, &ids[2], Mark::Good).unwrap();
        assert_eq!(warnings, vec![MarkWarning::OutsideRange(ids[2].clone())]);
        let warnings = engine.mark(&graph, &ids[4], Mark::Skip).unwrap();
        assert_eq!(
            warnings,
            vec![MarkWarning::Relabelled {
                commit: ids[4].clone(),
                from: Mark::Good,
                to: Mark::Skip
            }]
        );
        assert_eq!(engine.label_of(&ids[4]), Some(Mark::Skip));
    }

    #[test]
    fn unknown_commit_leaves_state_untouched() {
        let (graph, _ids, mut engine) = seeded(4);
        let before = engine.marks();
        let stranger = CommitId::new("deadbeef").unwrap();
        assert!(engine.mark(&graph, &stranger, Mark::Bad).is_err());
        assert_eq!(engine.marks(), before);
    }

    #[test]
    fn compile_error_over_threshold_is_excluded() {
        let (_graph, ids, mut engine) = seeded(6);
        assert_eq!(
            engine.classify_compile_failure(&ids[2], 2),
            BuildStatus::Unbuilt
        );
        assert!(engine.range().contains(&ids[2]));
        assert_eq!(
            engine.classify_compile_failure(&ids[2], 3),
            BuildStatus::CompileError
        );
        assert!(!engine.range().contains(&ids[2]));
    }

    #[test]
    fn advance_marks_or_pauses() {
        let (graph, ids, mut engine) = seeded(6);
        let policy = AutomationPolicy::manual().with_rule(AutomationRule::new(
            OutcomeMatcher::OutputContains {
                text: "regression".into(),
            },
            Mark::Bad,
        ));
        let paused = engine
            .advance(&graph, &ids[3], &ProcessOutcome::exited(0), &policy)
            .unwrap();
        assert_eq!(paused, AdvanceResult::NeedsManualInput);
        assert_eq!(engine.label_of(&ids[3]), None);

        let outcome = ProcessOutcome::exited(0).with_stdout("regression spotted");
        let marked = engine.advance(&graph, &ids[3], &outcome, &policy).unwrap();
        assert!(matches!(marked, AdvanceResult::Marked { mark: Mark::Bad, .. }));
        assert_eq!(engine.range(), &ids[1..=3]);
    }

    #[test]
    fn speculative_candidates_follow_both_outcomes() {
        let (graph, ids, engine) = seeded(16);
        let cached: HashSet<CommitId> = ids.iter().cloned().collect();
        let first = engine.speculative_candidates(&graph, &cached, 1).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, p)| *p == 1));

        let deeper = engine.speculative_candidates(&graph, &cached, 2).unwrap();
        assert_eq!(deeper.len(), 6);
        assert_eq!(deeper.iter().filter(|(_, p)| *p == 2).count(), 2);
    }

    #[test]
    fn close_reports_culprit_and_resume_hint() {
        let (graph, ids, mut engine) = seeded(3);
        engine.mark(&graph, &ids[1], Mark::Good).unwrap();
        assert_eq!(engine.phase(), Phase::Done);
        let report = engine.close(false);
        assert_eq!(report.culprit, Some(ids[2].clone()));
        assert!(report.resume_hint().contains("--good"));
        assert!(report.resume_hint().contains(ids[2].short()));
    }

    #[test]
    fn skipped_commits_before_the_bad_one_are_not_blamed() {
        let (graph, ids, mut engine) = seeded(4);
        engine.mark(&graph, &ids[1], Mark::Skip).unwrap();
        engine.mark(&graph, &ids[2], Mark::Skip).unwrap();
        assert_eq!(engine.range(), &ids[3..]);
        assert_eq!(engine.suspects(), &ids[1..]);
        assert_ne!(engine.phase(), Phase::Done);

        let none: HashSet<CommitId> = HashSet::new();
        assert_eq!(
            engine.next_candidate(&graph, &none).unwrap(),
            NextPick::Exhausted {
                remaining: ids[1..].to_vec()
            }
        );
        let report = engine.close(false);
        assert_eq!(report.culprit, None);
        assert_eq!(report.remaining, ids[1..].to_vec());

        // Testing one of them after all settles it.
        engine.mark(&graph, &ids[2], Mark::Good).unwrap();
        assert_eq!(engine.phase(), Phase::Done);
        assert_eq!(
            engine.next_candidate(&graph, &none).unwrap(),
            NextPick::Done(ids[3].clone())
        );
    }

    #[test]
    fn unbuildable_neighbour_keeps_the_culprit_open() {
        let (graph, ids, mut engine) = seeded(4);
        engine.mark(&graph, &ids[1], Mark::Good).unwrap();
        assert_eq!(
            engine.classify_compile_failure(&ids[2], 5),
            BuildStatus::CompileError
        );
        assert_eq!(engine.range(), &ids[3..]);
        assert_eq!(engine.phase(), Phase::Narrowing);
        let none: HashSet<CommitId> = HashSet::new();
        assert_eq!(
            engine.next_candidate(&graph, &none).unwrap(),
            NextPick::Exhausted {
                remaining: vec![ids[2].clone(), ids[3].clone()]
            }
        );
        assert_eq!(engine.close(false).culprit, None);
    }

    #[test]
    fn excluded_commits_still_count_as_suspects() {
        let (graph, ids) = MemoryCommitGraph::linear(3);
        let mut engine =
            BisectEngine::new(EngineOptions::default()).with_excluded([ids[1].clone()]);
        engine.mark(&graph, &ids[0], Mark::Good).unwrap();
        engine.mark(&graph, &ids[2], Mark::Bad).unwrap();
        assert_eq!(engine.range(), &ids[2..]);
        assert_eq!(engine.phase(), Phase::Narrowing);
        assert!(engine.close(false).culprit.is_none());
    }

    #[test]
    fn balance_counts_merged_history_once() {
        // 0 - 1 - 2 - 4 - 5
        //      \- 3 -/
        let mut graph = MemoryCommitGraph::new();
        let ids: Vec<CommitId> = (0..6).map(synthetic_id).collect();
        graph.add_commit(ids[0].clone(), &[]).unwrap();
        graph.add_commit(ids[1].clone(), &[ids[0].clone()]).unwrap();
        graph.add_commit(ids[2].clone(), &[ids[1].clone()]).unwrap();
        graph.add_commit(ids[3].clone(), &[ids[1].clone()]).unwrap();
        graph
            .add_commit(ids[4].clone(), &[ids[2].clone(), ids[3].clone()])
            .unwrap();
        graph.add_commit(ids[5].clone(), &[ids[4].clone()]).unwrap();

        let mut engine = BisectEngine::new(EngineOptions::default());
        engine.mark(&graph, &ids[0], Mark::Good).unwrap();
        engine.mark(&graph, &ids[5], Mark::Bad).unwrap();
        let cached: HashSet<CommitId> = ids.iter().cloned().collect();
        // Either branch tip splits the rest 2/2; the fork and the merge
        // leave 4 on one side.
        assert_eq!(
            engine.next_candidate(&graph, &cached).unwrap(),
            NextPick::Test {
                commit: ids[2].clone(),
                cached: true
            }
        );
    }

    #[test]
    fn picking_in_a_long_range_needs_no_ancestry_walks() {
        let (inner, ids) = MemoryCommitGraph::linear(2000);
        let graph = CountingGraph {
            inner,
            walks: AtomicUsize::new(0),
        };
        let mut engine = BisectEngine::new(EngineOptions::default());
        engine.mark(&graph, &ids[0], Mark::Good).unwrap();
        engine.mark(&graph, &ids[1999], Mark::Bad).unwrap();
        let seeded_walks = graph.walks.load(Ordering::SeqCst);

        let cached: HashSet<CommitId> = ids.iter().cloned().collect();
        assert_eq!(
            engine.next_candidate(&graph, &cached).unwrap(),
            NextPick::Test {
                commit: ids[999].clone(),
                cached: true
            }
        );
        assert_eq!(graph.walks.load(Ordering::SeqCst), seeded_walks);

        let ahead = engine.speculative_candidates(&graph, &cached, 2).unwrap();
        assert_eq!(ahead.len(), 6);
    }
}
