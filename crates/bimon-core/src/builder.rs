//! Compiler capability and the system-wide compile gate.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::CommitId;
use crate::metrics::METRICS;

/// Build output left in the builder's workspace.
///
/// The workspace is reused by the next compile, so the output must be
/// handed to the store before compiling again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub source_root: PathBuf,
    /// Files or directories relative to `source_root`.
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success(CompiledArtifact),
    Failure { log: String },
    /// Interrupted by the user; never cached.
    Aborted,
}

/// Compiles one commit.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn compile(&self, commit: &CommitId) -> BuildOutcome;
}

/// Whether a failed compile should be blamed on the commit itself.
///
/// Until `threshold` other compiles have succeeded in the same run, a
/// failure is more likely a broken toolchain than a broken commit.
pub fn failure_is_commit_specific(prior_successes: usize, threshold: usize) -> bool {
    prior_successes >= threshold
}

/// Serializes compilation across the process.
///
/// Clones share the same lock. Extraction and prefetch never take it.
#[derive(Clone, Default)]
pub struct CompileGate {
    lock: Arc<Mutex<()>>,
}

impl CompileGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn compile(&self, builder: &dyn Builder, commit: &CommitId) -> BuildOutcome {
        let _guard = self.lock.lock().await;
        debug!(commit = %commit.short(), "compiling");
        METRICS.inc_compiles();
        let outcome = builder.compile(commit).await;
        if matches!(outcome, BuildOutcome::Failure { .. }) {
            METRICS.inc_compile_failures();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::graph::memory::synthetic_id;

    #[derive(Default)]
    struct OverlapBuilder {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl Builder for OverlapBuilder {
        async fn compile(&self, _commit: &CommitId) -> BuildOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            BuildOutcome::Failure { log: "nope".into() }
        }
    }

    #[test]
    fn threshold_boundary() {
        assert!(!failure_is_commit_specific(2, 3));
        assert!(failure_is_commit_specific(3, 3));
        assert!(failure_is_commit_specific(5, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn gate_allows_one_compile_at_a_time() {
        let builder = Arc::new(OverlapBuilder::default());
        let gate = CompileGate::new();
        let mut handles = Vec::new();
        for i in 0..4 {
            let (builder, gate) = (Arc::clone(&builder), gate.clone());
            handles.push(tokio::spawn(async move {
                gate.compile(builder.as_ref(), &synthetic_id(i)).await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                BuildOutcome::Failure { .. }
            ));
        }
        assert_eq!(builder.max_active.load(Ordering::SeqCst), 1);
    }
}
