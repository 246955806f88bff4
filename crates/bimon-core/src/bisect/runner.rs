//! Async session driver: pick, fetch or compile, test, mark, repeat.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn, Instrument};

use super::automation::{AutomationPolicy, ProcessOutcome};
use super::engine::{AdvanceResult, BisectEngine, MarkWarning, NextPick, SessionReport};
use super::error::BisectError;
use super::session::SessionRecord;
use crate::builder::{BuildOutcome, Builder, CompileGate, CompiledArtifact};
use crate::domain::{BimonError, BuildStatus, CommitId, Mark, Result};
use crate::graph::CommitGraph;
use crate::metrics::METRICS;
use crate::obs;
use crate::prefetch::{PrefetchPool, TOP_PRIORITY};
use crate::store::{ArtifactCatalog, ArtifactStore};

/// Runs the artifact of one commit and reports what happened.
#[async_trait]
pub trait Tester: Send + Sync {
    async fn run(&self, commit: &CommitId, artifact_dir: &Path) -> Result<ProcessOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// How many hypothetical outcomes ahead to prefetch.
    pub prefetch_depth: usize,
    pub prefetch_width: usize,
    /// Working copies kept when the session closes.
    pub lru_keep: usize,
    /// Persist marks to the store root after every change.
    pub persist_session: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            prefetch_depth: 2,
            prefetch_width: 2,
            lru_keep: 10,
            persist_session: true,
        }
    }
}

/// Why the loop stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Found(CommitId),
    CacheExhausted(Vec<CommitId>),
    Exhausted(Vec<CommitId>),
    Contradiction(String),
    NeedsSeed,
}

/// Result of a single iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Marked {
        commit: CommitId,
        mark: Mark,
        warnings: Vec<MarkWarning>,
    },
    CompileFailed {
        commit: CommitId,
        status: BuildStatus,
    },
    /// No automation rule matched; a human has to mark `commit`.
    Paused {
        commit: CommitId,
        outcome: ProcessOutcome,
    },
    Finished(SessionEnd),
}

pub struct BisectRunner {
    engine: BisectEngine,
    graph: Arc<dyn CommitGraph>,
    store: Arc<ArtifactStore>,
    pool: PrefetchPool,
    builder: Arc<dyn Builder>,
    tester: Arc<dyn Tester>,
    gate: CompileGate,
    policy: AutomationPolicy,
    options: RunnerOptions,
    session: SessionRecord,
    span: tracing::Span,
    uncommitted: Option<(CommitId, CompiledArtifact)>,
    compile_successes: usize,
}

impl BisectRunner {
    /// Must be called inside a tokio runtime; spawns the prefetch workers.
    pub fn new(
        engine: BisectEngine,
        graph: Arc<dyn CommitGraph>,
        store: Arc<ArtifactStore>,
        builder: Arc<dyn Builder>,
        tester: Arc<dyn Tester>,
        policy: AutomationPolicy,
        options: RunnerOptions,
    ) -> Self {
        let pool = PrefetchPool::new(store.clone(), options.prefetch_width);
        let session = SessionRecord::new();
        let span = obs::session_span(&session.session_id);
        Self {
            engine,
            graph,
            store,
            pool,
            builder,
            tester,
            gate: CompileGate::new(),
            policy,
            options,
            session,
            span,
            uncommitted: None,
            compile_successes: 0,
        }
    }

    /// Share a compile gate with other compile drivers in the process.
    pub fn with_gate(mut self, gate: CompileGate) -> Self {
        self.gate = gate;
        self
    }

    /// Continue a saved session's id and marks.
    pub fn resume(mut self, record: SessionRecord) -> Result<Self> {
        self.engine.restore(self.graph.as_ref(), &record.marks)?;
        self.span = obs::session_span(&record.session_id);
        self.session = record;
        Ok(self)
    }

    pub fn engine(&self) -> &BisectEngine {
        &self.engine
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Manual mark, e.g. from the seed arguments or a paused session.
    pub fn mark(&mut self, commit: &CommitId, mark: Mark) -> Result<Vec<MarkWarning>> {
        let warnings = self.engine.mark(self.graph.as_ref(), commit, mark)?;
        obs::emit_marked(commit, mark, false);
        self.persist()?;
        Ok(warnings)
    }

    pub fn unmark(&mut self, commit: &CommitId) -> Result<bool> {
        let changed = self.engine.unmark(self.graph.as_ref(), commit)?;
        if changed {
            self.persist()?;
        }
        Ok(changed)
    }

    fn persist(&mut self) -> Result<()> {
        if self.options.persist_session {
            self.session.save(self.store.root(), self.engine.marks())?;
        }
        Ok(())
    }

    /// Run one pick → obtain → test → mark iteration.
    pub async fn step(&mut self) -> Result<Step> {
        let span = self.span.clone();
        self.step_inner().instrument(span).await
    }

    async fn step_inner(&mut self) -> Result<Step> {
        let pick = self
            .engine
            .next_candidate(self.graph.as_ref(), self.store.as_ref())?;
        let commit = match pick {
            NextPick::Test { commit, .. } => commit,
            NextPick::Done(commit) => return Ok(Step::Finished(SessionEnd::Found(commit))),
            NextPick::CacheExhausted { remaining } => {
                return Ok(Step::Finished(SessionEnd::CacheExhausted(remaining)))
            }
            NextPick::Exhausted { remaining } => {
                return Ok(Step::Finished(SessionEnd::Exhausted(remaining)))
            }
            NextPick::Contradiction(reason) => {
                return Ok(Step::Finished(SessionEnd::Contradiction(reason)))
            }
            NextPick::NeedsSeed => return Ok(Step::Finished(SessionEnd::NeedsSeed)),
        };

        self.prefetch_ahead(&commit).await?;

        let dir = match self.obtain(&commit).await? {
            Ok(dir) => dir,
            Err(status) => return Ok(Step::CompileFailed { commit, status }),
        };

        let outcome = self.tester.run(&commit, &dir).await?;
        match self.engine.advance(
            self.graph.as_ref(),
            &commit,
            &outcome,
            &self.policy,
        )? {
            AdvanceResult::Marked { mark, warnings } => {
                self.persist()?;
                Ok(Step::Marked {
                    commit,
                    mark,
                    warnings,
                })
            }
            AdvanceResult::NeedsManualInput => Ok(Step::Paused { commit, outcome }),
        }
    }

    /// Queue likely next picks and drop queued work that is no longer likely.
    ///
    /// Planning walks hypothetical outcomes, so it runs on the blocking pool.
    async fn prefetch_ahead(&self, current: &CommitId) -> Result<()> {
        let depth = self.options.prefetch_depth;
        if depth == 0 {
            return Ok(());
        }
        let engine = self.engine.clone();
        let graph = Arc::clone(&self.graph);
        let store = Arc::clone(&self.store);
        let planned = tokio::task::spawn_blocking(move || {
            engine.speculative_candidates(graph.as_ref(), store.as_ref(), depth)
        })
        .await;
        let ahead = match planned {
            Ok(ahead) => ahead?,
            Err(e) => {
                warn!(error = %e, "prefetch planning failed");
                return Ok(());
            }
        };
        let mut keep: HashSet<CommitId> = ahead.iter().map(|(c, _)| c.clone()).collect();
        keep.insert(current.clone());
        self.pool.retain(&keep);
        if self.store.is_cached(current) {
            self.pool.schedule(current, TOP_PRIORITY)?;
        }
        for (commit, priority) in ahead {
            self.pool.schedule(&commit, priority)?;
        }
        Ok(())
    }

    /// A runnable directory for `commit`, or the status of a failed compile.
    async fn obtain(&mut self, commit: &CommitId) -> Result<std::result::Result<PathBuf, BuildStatus>> {
        if self.store.is_cached(commit) {
            return Ok(Ok(self.pool.await_commit(commit).await?));
        }

        // The builder reuses its workspace, so store the previous output first.
        self.commit_uncommitted()?;
        match self.gate.compile(self.builder.as_ref(), commit).await {
            BuildOutcome::Success(artifact) => {
                self.compile_successes += 1;
                let dir = artifact.source_root.clone();
                self.uncommitted = Some((commit.clone(), artifact));
                Ok(Ok(dir))
            }
            BuildOutcome::Failure { log } => {
                let status = self
                    .engine
                    .classify_compile_failure(commit, self.compile_successes);
                warn!(
                    commit = %commit.short(),
                    classified = status == BuildStatus::CompileError,
                    log_tail = %log.lines().last().unwrap_or_default(),
                    "compile failed"
                );
                if status == BuildStatus::CompileError {
                    self.store.add_compile_errors(std::slice::from_ref(commit))?;
                } else {
                    // Transient: keep it out of this session only.
                    self.engine.mark(self.graph.as_ref(), commit, Mark::Skip)?;
                    self.persist()?;
                }
                Ok(Err(status))
            }
            BuildOutcome::Aborted => Err(BimonError::Aborted),
        }
    }

    /// Hand the last compiled artifact to the store.
    fn commit_uncommitted(&mut self) -> Result<()> {
        if let Some((commit, artifact)) = self.uncommitted.take() {
            if self.store.is_cached(&commit) {
                return Ok(());
            }
            self.store
                .store_raw(&commit, &artifact.source_root, &artifact.paths)?;
        }
        Ok(())
    }

    /// Loop until a human is needed or the search ends.
    pub async fn run_until_pause(&mut self) -> Result<Step> {
        loop {
            match self.step().await? {
                Step::Marked { .. } | Step::CompileFailed { .. } => continue,
                other => return Ok(other),
            }
        }
    }

    /// Loop without any human input.
    ///
    /// Outcomes no rule matches are marked skip. A contradiction or a
    /// missing seed is an error since nobody is there to fix the marks.
    pub async fn run_headless(&mut self) -> Result<SessionEnd> {
        loop {
            match self.run_until_pause().await? {
                Step::Paused { commit, .. } => {
                    warn!(commit = %commit.short(), "no automation rule matched, skipping");
                    self.mark(&commit, Mark::Skip)?;
                }
                Step::Finished(SessionEnd::Contradiction(reason)) => {
                    return Err(BisectError::Contradiction(reason).into())
                }
                Step::Finished(SessionEnd::NeedsSeed) => return Err(BisectError::NotSeeded.into()),
                Step::Finished(end) => return Ok(end),
                Step::Marked { .. } | Step::CompileFailed { .. } => {}
            }
        }
    }

    /// End the session.
    ///
    /// Unless `discard`, the last compiled artifact is stored. Working
    /// copies are trimmed to the configured count and the saved marks are
    /// removed once the culprit is known.
    pub async fn close(mut self, discard: bool) -> Result<SessionReport> {
        if discard {
            self.uncommitted = None;
        } else {
            self.commit_uncommitted()?;
        }
        self.pool.shutdown().await;
        self.store.evict_lru(self.options.lru_keep)?;

        let report = self.engine.close(discard);
        if self.options.persist_session {
            if report.culprit.is_some() {
                SessionRecord::clear(self.store.root())?;
            } else {
                self.persist()?;
            }
        }
        obs::emit_session_closed(&self.session.session_id, report.remaining.len(), discard);
        info!(resume = %report.resume_hint(), "bisect session closed");
        METRICS.flush();
        Ok(report)
    }
}
