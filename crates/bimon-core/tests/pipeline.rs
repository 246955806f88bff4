//! Precompile and bisect sessions driven end to end with scripted
//! builder and tester fakes.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bimon_core::{
    ArtifactCatalog, ArtifactStore, AutomationPolicy, BimonError, BisectEngine, BisectError,
    BisectRunner, BuildOutcome, BuildStatus, Builder, CommitGraph, CommitId, CompiledArtifact,
    EngineOptions, EverySample, EvenlySpaced, Mark, MemoryCommitGraph, PrecompileOptions,
    Precompiler, ProcessOutcome, Result, RunnerOptions, SessionEnd, SessionRecord, Step,
    StoreOptions, Tester,
};

/// Writes `bin/app` containing the commit hash into a reused workspace.
struct ScriptedBuilder {
    workspace: PathBuf,
    fail: HashSet<CommitId>,
    abort: Option<CommitId>,
    built: Mutex<Vec<CommitId>>,
}

impl ScriptedBuilder {
    fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            fail: HashSet::new(),
            abort: None,
            built: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, commits: &[CommitId]) -> Self {
        self.fail.extend(commits.iter().cloned());
        self
    }

    fn built(&self) -> Vec<CommitId> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn compile(&self, commit: &CommitId) -> BuildOutcome {
        self.built.lock().unwrap().push(commit.clone());
        if self.abort.as_ref() == Some(commit) {
            return BuildOutcome::Aborted;
        }
        if self.fail.contains(commit) {
            return BuildOutcome::Failure {
                log: format!("error: cannot build {commit}"),
            };
        }
        let bin = self.workspace.join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("app"), commit.as_str()).unwrap();
        BuildOutcome::Success(CompiledArtifact {
            source_root: self.workspace.clone(),
            paths: vec![PathBuf::from("bin")],
        })
    }
}

/// Crashes for every commit at or after `culprit` in `history`.
struct ScriptedTester {
    history: Vec<CommitId>,
    culprit: usize,
}

#[async_trait]
impl Tester for ScriptedTester {
    async fn run(&self, commit: &CommitId, artifact_dir: &Path) -> Result<ProcessOutcome> {
        let built_for = fs::read_to_string(artifact_dir.join("bin/app"))?;
        assert_eq!(built_for, commit.as_str(), "tester got the wrong artifact");
        let pos = self
            .history
            .iter()
            .position(|c| c == commit)
            .expect("commit from history");
        Ok(if pos >= self.culprit {
            ProcessOutcome::killed(11).with_stderr("Segmentation fault")
        } else {
            ProcessOutcome::exited(0)
        })
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    store: Arc<ArtifactStore>,
    graph: Arc<MemoryCommitGraph>,
    ids: Vec<CommitId>,
}

impl Fixture {
    fn new(n: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(ArtifactStore::open(dir.path().join("store"), StoreOptions::default()).unwrap());
        let (graph, ids) = MemoryCommitGraph::linear(n);
        Self {
            dir,
            store,
            graph: Arc::new(graph),
            ids,
        }
    }

    fn workspace(&self) -> PathBuf {
        self.dir.path().join("workspace")
    }

    fn precache(&self, indices: &[usize]) {
        for &i in indices {
            let ws = self.dir.path().join(format!("pre-{i}"));
            fs::create_dir_all(ws.join("bin")).unwrap();
            fs::write(ws.join("bin/app"), self.ids[i].as_str()).unwrap();
            self.store
                .store_raw(&self.ids[i], &ws, &[PathBuf::from("bin")])
                .unwrap();
        }
    }

    fn runner(
        &self,
        builder: Arc<ScriptedBuilder>,
        culprit: usize,
        policy: AutomationPolicy,
    ) -> BisectRunner {
        let tester = Arc::new(ScriptedTester {
            history: self.ids.clone(),
            culprit,
        });
        BisectRunner::new(
            BisectEngine::new(EngineOptions::default()),
            self.graph.clone() as Arc<dyn CommitGraph>,
            Arc::clone(&self.store),
            builder,
            tester,
            policy,
            RunnerOptions::default(),
        )
    }

    fn precompiler(&self, builder: Arc<ScriptedBuilder>, options: PrecompileOptions) -> Precompiler {
        Precompiler::new(
            Arc::clone(&self.store),
            self.graph.clone() as Arc<dyn CommitGraph>,
            builder,
            options,
        )
    }
}

#[tokio::test]
async fn headless_session_finds_culprit_using_cache_and_compiles() {
    let fx = Fixture::new(20);
    fx.precache(&[0, 5, 10, 15, 19]);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()));
    let mut runner = fx.runner(builder.clone(), 13, AutomationPolicy::crash_detection());

    runner.mark(&fx.ids[0], Mark::Good).unwrap();
    runner.mark(&fx.ids[19], Mark::Bad).unwrap();
    assert!(SessionRecord::path(fx.store.root()).exists());

    let end = runner.run_headless().await.unwrap();
    assert_eq!(end, SessionEnd::Found(fx.ids[13].clone()));

    let report = runner.close(false).await.unwrap();
    assert_eq!(report.culprit, Some(fx.ids[13].clone()));
    assert!(!SessionRecord::path(fx.store.root()).exists());

    let built = builder.built();
    assert!(!built.is_empty());
    for commit in &built {
        assert!(fx.store.is_cached(commit), "{commit} was compiled but not stored");
    }
    assert!(!built.contains(&fx.ids[10]), "cached commit was recompiled");
}

#[tokio::test]
async fn transient_compile_failure_skips_commit() {
    let fx = Fixture::new(4);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()).failing(&[fx.ids[1].clone()]));
    let mut runner = fx.runner(builder, 2, AutomationPolicy::crash_detection());
    runner.mark(&fx.ids[0], Mark::Good).unwrap();
    runner.mark(&fx.ids[3], Mark::Bad).unwrap();

    assert_eq!(
        runner.step().await.unwrap(),
        Step::CompileFailed {
            commit: fx.ids[1].clone(),
            status: BuildStatus::Unbuilt,
        }
    );
    assert_eq!(runner.engine().label_of(&fx.ids[1]), Some(Mark::Skip));
    assert_eq!(fx.store.status(&fx.ids[1]).unwrap(), BuildStatus::Unbuilt);

    let step = runner.step().await.unwrap();
    assert!(matches!(
        step,
        Step::Marked { ref commit, mark: Mark::Bad, .. } if *commit == fx.ids[2]
    ));
    // The skipped commit may still be the culprit.
    assert_eq!(
        runner.step().await.unwrap(),
        Step::Finished(SessionEnd::Exhausted(vec![
            fx.ids[1].clone(),
            fx.ids[2].clone()
        ]))
    );
    let report = runner.close(false).await.unwrap();
    assert!(report.culprit.is_none());
    assert!(fx.store.is_cached(&fx.ids[2]));
}

#[tokio::test]
async fn headless_session_without_seed_is_an_error() {
    let fx = Fixture::new(4);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()));
    let mut runner = fx.runner(builder.clone(), 2, AutomationPolicy::crash_detection());
    runner.mark(&fx.ids[3], Mark::Bad).unwrap();
    let err = runner.run_headless().await.unwrap_err();
    assert!(matches!(err, BimonError::Bisect(BisectError::NotSeeded)));
    assert!(builder.built().is_empty());
}

#[tokio::test]
async fn unmatched_outcome_pauses_for_manual_mark() {
    let fx = Fixture::new(6);
    fx.precache(&[0, 1, 2, 3, 4, 5]);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()));
    let mut runner = fx.runner(builder.clone(), 3, AutomationPolicy::manual());
    runner.mark(&fx.ids[0], Mark::Good).unwrap();
    runner.mark(&fx.ids[5], Mark::Bad).unwrap();

    let Step::Paused { commit, outcome } = runner.run_until_pause().await.unwrap() else {
        panic!("manual policy must pause");
    };
    assert_eq!(outcome.crashed(), commit >= fx.ids[3]);
    runner.mark(&commit, Mark::Good).unwrap();
    assert_eq!(runner.engine().label_of(&commit), Some(Mark::Good));
    assert!(builder.built().is_empty());

    let report = runner.close(true).await.unwrap();
    assert!(report.discarded);
    assert!(report.culprit.is_none());
    // An unfinished session stays resumable.
    let saved = SessionRecord::load(fx.store.root()).unwrap();
    assert!(saved.marks.good.contains(&commit));
}

#[tokio::test]
async fn resumed_session_continues_from_saved_marks() {
    let fx = Fixture::new(8);
    fx.precache(&[0, 1, 2, 3, 4, 5, 6, 7]);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()));
    {
        let mut runner = fx.runner(builder.clone(), 6, AutomationPolicy::crash_detection());
        runner.mark(&fx.ids[0], Mark::Good).unwrap();
        runner.mark(&fx.ids[7], Mark::Bad).unwrap();
        runner.step().await.unwrap();
        runner.close(false).await.unwrap();
    }

    let record = SessionRecord::load(fx.store.root()).unwrap();
    let session_id = record.session_id.clone();
    let mut runner = fx
        .runner(builder, 6, AutomationPolicy::crash_detection())
        .resume(record)
        .unwrap();
    assert_eq!(runner.session_id(), session_id);
    assert_eq!(
        runner.run_headless().await.unwrap(),
        SessionEnd::Found(fx.ids[6].clone())
    );
}

#[tokio::test]
async fn precompile_stores_classifies_and_seals() {
    let fx = Fixture::new(8);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()).failing(&[fx.ids[1].clone()]));
    let options = PrecompileOptions {
        bundle_size: 2,
        compile_error_threshold: 3,
        retry_compress: true,
        compress: true,
    };
    let pre = fx.precompiler(builder.clone(), options.clone());

    let report = pre.run(&fx.ids, &EverySample).await.unwrap();
    assert!(!report.cancelled);
    assert_eq!(builder.built(), fx.ids, "nearest-diff order follows history");
    assert_eq!(report.failed, vec![fx.ids[1].clone()]);
    // Classified retroactively once three builds succeeded.
    assert_eq!(report.classified, vec![fx.ids[1].clone()]);
    assert_eq!(fx.store.status(&fx.ids[1]).unwrap(), BuildStatus::CompileError);
    assert_eq!(report.compiled.len(), 7);

    // Two bundles after four successes, one more at the end; ids[7] is left over.
    assert_eq!(report.bundles.len(), 3);
    assert_eq!(
        report.bundles[0].commits,
        vec![fx.ids[0].clone(), fx.ids[2].clone()]
    );
    assert!(fx.store.lookup(&fx.ids[6]).is_bundled());
    assert!(fx.store.lookup(&fx.ids[7]).is_raw());

    // Nothing left to do on a second run.
    let again = fx
        .precompiler(builder.clone(), options)
        .run(&fx.ids, &EverySample)
        .await
        .unwrap();
    assert!(again.compiled.is_empty());
    assert!(again.failed.is_empty());
}

#[tokio::test]
async fn precompile_failures_after_threshold_are_classified_immediately() {
    let fx = Fixture::new(6);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()).failing(&[fx.ids[4].clone()]));
    let pre = fx.precompiler(
        builder,
        PrecompileOptions {
            compress: false,
            ..PrecompileOptions::default()
        },
    );
    let report = pre.run(&fx.ids, &EverySample).await.unwrap();
    assert_eq!(report.classified, vec![fx.ids[4].clone()]);
    assert!(report.bundles.is_empty());
    assert_eq!(fx.store.pending_bundle().len(), 5);
}

#[tokio::test]
async fn precompile_sampling_and_cancellation() {
    let fx = Fixture::new(9);
    fx.precache(&[4]);
    let builder = Arc::new(ScriptedBuilder::new(fx.workspace()));
    let pre = fx.precompiler(
        builder.clone(),
        PrecompileOptions {
            compress: false,
            ..PrecompileOptions::default()
        },
    );
    let report = pre.run(&fx.ids, &EvenlySpaced { n: 2 }).await.unwrap();
    let mut compiled = report.compiled.clone();
    compiled.sort();
    let mut expected = vec![
        fx.ids[1].clone(),
        fx.ids[3].clone(),
        fx.ids[6].clone(),
        fx.ids[8].clone(),
    ];
    expected.sort();
    assert_eq!(compiled, expected);

    let pre = fx.precompiler(builder.clone(), PrecompileOptions::default());
    pre.cancel_flag().store(true, Ordering::SeqCst);
    let before = builder.built().len();
    let report = pre.run(&fx.ids, &EverySample).await.unwrap();
    assert!(report.cancelled);
    assert!(report.compiled.is_empty());
    assert_eq!(builder.built().len(), before);
}

#[tokio::test]
async fn aborted_compile_stops_precompile_without_caching() {
    let fx = Fixture::new(5);
    let mut builder = ScriptedBuilder::new(fx.workspace());
    builder.abort = Some(fx.ids[2].clone());
    let builder = Arc::new(builder);
    let pre = fx.precompiler(builder, PrecompileOptions::default());
    let report = pre.run(&fx.ids, &EverySample).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.compiled, vec![fx.ids[0].clone(), fx.ids[1].clone()]);
    assert!(!fx.store.is_cached(&fx.ids[2]));
    assert!(report.bundles.is_empty());
}
