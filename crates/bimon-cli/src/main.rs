//! BiMon - cache-accelerated regression bisection
//!
//! The `bimon` command keeps compiled artifacts of past commits and uses
//! them to bisect regressions without rebuilding every step.
//!
//! ## Commands
//!
//! - `compile`: Build commits and cache their artifacts
//! - `update`: Precompile a sample of a commit range
//! - `compress`: Seal raw artifacts into bundles
//! - `extract`: Unpack one cached artifact into a directory
//! - `purge`: Remove duplicate artifacts and stray files
//! - `evict`: Trim extracted working copies
//! - `status`: Show store contents or per-commit build status
//! - `bisect`: Find the first bad commit

mod exec;
mod input;

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bimon_core::config::CONFIG_FILE;
use bimon_core::{
    is_git_repo, resolve_ref, ArtifactLocation, ArtifactStore, BimonConfig, BimonError,
    BisectEngine, BisectError, BisectRunner, BuildStatus, BundlePacker, CachedCommitGraph,
    CommitGraph, CommitId, EverySample, EvenlySpaced, GitCommitGraph, LargestDiffFirst, Mark,
    MarkWarning, Precompiler, SamplingStrategy, SessionEnd, SessionRecord, Step,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn, Level};

use exec::{CommandBuilder, CommandTester};
use input::Command;

#[derive(Parser)]
#[command(name = "bimon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bisect regressions using cached build artifacts", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build commits and store their artifacts
    Compile {
        /// Commits or refs to build (default: HEAD)
        commits: Vec<String>,
    },

    /// Precompile a range of history
    Update {
        /// Keep every n-th commit that is not cached yet
        #[arg(short = 'n', long, default_value_t = 1)]
        every: usize,

        /// Only commits after this one
        #[arg(long)]
        from: Option<String>,

        /// Last commit of the range
        #[arg(long, default_value = "HEAD")]
        to: String,

        /// Build only the commits with the largest diffs, at most this many
        #[arg(long, conflicts_with = "every")]
        largest_diff: Option<usize>,

        /// Leave built artifacts raw instead of sealing bundles
        #[arg(long)]
        no_compress: bool,
    },

    /// Seal pending raw artifacts into bundles
    Compress {
        /// Also seal a final group smaller than the bundle size
        #[arg(long)]
        all: bool,
    },

    /// Unpack the artifact of one commit
    Extract {
        /// Commit or ref
        reference: String,

        /// Destination directory (default: ./bimon-<short hash>)
        destination: Option<PathBuf>,
    },

    /// Remove redundant data from the store
    Purge {
        /// Drop raw copies of commits that are also bundled
        #[arg(long)]
        duplicates: bool,

        /// Drop files the index does not know about
        #[arg(long)]
        loose_files: bool,
    },

    /// Delete least recently used working copies
    Evict {
        /// Working copies to keep (default: lru_keep from the config)
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Show store contents, or the status of the given commits
    Status {
        /// Commits or refs to inspect
        commits: Vec<String>,
    },

    /// Find the first bad commit
    Bisect {
        /// Known good commits
        #[arg(long)]
        good: Vec<String>,

        /// Known bad commits
        #[arg(long)]
        bad: Vec<String>,

        /// Only test commits that are already cached
        #[arg(long)]
        cached_only: bool,

        /// Also consider commits listed as ignored or unbuildable
        #[arg(long)]
        include_unbuildable: bool,

        /// Continue from the marks saved by the last session
        #[arg(long)]
        resume: bool,

        /// Never prompt; unmatched outcomes are skipped
        #[arg(long)]
        headless: bool,

        /// Do not store the last compiled artifact on exit
        #[arg(long)]
        discard: bool,

        /// Tip of the history to search
        #[arg(long, default_value = "HEAD")]
        head: String,
    },
}

/// Configuration plus the store it points at.
struct Workspace {
    config: BimonConfig,
    store: Arc<ArtifactStore>,
}

impl Workspace {
    fn open(config_path: &Path) -> Result<Self> {
        let config = BimonConfig::load(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
            .with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        let store = ArtifactStore::open(&config.store_dir, config.store_options())
            .with_context(|| format!("Failed to open store at {}", config.store_dir.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    fn load_graph(&self, from: Option<&str>, to: &str) -> Result<Arc<GitCommitGraph>> {
        Ok(Arc::new(self.read_history(from, to)?))
    }

    fn read_history(&self, from: Option<&str>, to: &str) -> Result<GitCommitGraph> {
        let repo = &self.config.workspace_path;
        if !is_git_repo(repo) {
            bail!("{} is not a git repository", repo.display());
        }
        GitCommitGraph::load(repo, from, to).with_context(|| format!("Failed to read history of {to}"))
    }

    fn require_build(&self) -> Result<()> {
        if !self.config.can_build() {
            bail!("build_command and artifact_paths must be set in the configuration");
        }
        Ok(())
    }
}

/// Set the returned flag on Ctrl-C so running builds stop cleanly.
fn cancel_on_interrupt() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current build");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

fn describe_status(status: &BuildStatus) -> String {
    match status {
        BuildStatus::Unbuilt => "not built".to_string(),
        BuildStatus::Cached {
            location: ArtifactLocation::Raw { .. },
        } => "cached (raw)".to_string(),
        BuildStatus::Cached {
            location: ArtifactLocation::Bundled { bundle_id, index },
        } => format!("cached (bundle {bundle_id}, slot {index})"),
        BuildStatus::Cached {
            location: ArtifactLocation::Absent,
        } => "cached (missing)".to_string(),
        BuildStatus::CompileError => "compile error".to_string(),
        BuildStatus::Ignored => "ignored".to_string(),
    }
}

fn print_warnings(warnings: &[MarkWarning]) {
    for warning in warnings {
        match warning {
            MarkWarning::OutsideRange(commit) => {
                println!("  note: {} is outside the current range", commit.short())
            }
            MarkWarning::Relabelled { commit, from, to } => {
                println!("  note: {} changed from {from} to {to}", commit.short())
            }
        }
    }
}

async fn cmd_compile(ws: &Workspace, refs: &[String]) -> Result<()> {
    ws.require_build()?;
    let graph = ws.load_graph(None, "--all")?;
    let refs = if refs.is_empty() {
        vec!["HEAD".to_string()]
    } else {
        refs.to_vec()
    };
    let commits = refs
        .iter()
        .map(|r| graph.resolve(r))
        .collect::<bimon_core::Result<Vec<_>>>()?;

    let cancel = cancel_on_interrupt();
    let builder = Arc::new(CommandBuilder::from_config(&ws.config, cancel.clone()));
    let mut options = ws.config.precompile_options();
    options.compress = false;
    let precompiler = Precompiler::new(ws.store.clone(), graph, builder, options)
        .with_cancel_flag(cancel);
    let report = precompiler.run(&commits, &EverySample).await?;

    for commit in &report.compiled {
        println!("✓ {} cached", commit.short());
    }
    for commit in &report.failed {
        println!("✗ {} failed to compile", commit.short());
    }
    if report.cancelled {
        println!("Interrupted.");
    }
    Ok(())
}

async fn cmd_update(
    ws: &Workspace,
    every: usize,
    from: Option<&str>,
    to: &str,
    largest_diff: Option<usize>,
    no_compress: bool,
) -> Result<()> {
    ws.require_build()?;
    if every == 0 {
        bail!("-n must be at least 1");
    }
    let graph = ws.load_graph(from, to)?;
    let commits = graph.commits().to_vec();
    let strategy: Box<dyn SamplingStrategy> = match largest_diff {
        Some(limit) => Box::new(LargestDiffFirst { limit: Some(limit) }),
        None if every == 1 => Box::new(EverySample),
        None => Box::new(EvenlySpaced { n: every }),
    };

    let cancel = cancel_on_interrupt();
    let builder = Arc::new(CommandBuilder::from_config(&ws.config, cancel.clone()));
    let mut options = ws.config.precompile_options();
    options.compress = !no_compress;
    let precompiler = Precompiler::new(ws.store.clone(), graph, builder, options)
        .with_cancel_flag(cancel);
    let report = precompiler.run(&commits, strategy.as_ref()).await?;

    println!("Compiled: {}", report.compiled.len());
    println!("Failed:   {}", report.failed.len());
    if !report.classified.is_empty() {
        println!("Recorded as compile errors:");
        for commit in &report.classified {
            println!("  {}", commit.short());
        }
    }
    for bundle in &report.bundles {
        println!(
            "Sealed {} ({} commits, {} bytes)",
            bundle.bundle_id,
            bundle.commits.len(),
            bundle.size_bytes
        );
    }
    if report.cancelled {
        println!("Interrupted; pending artifacts were left raw.");
    }
    Ok(())
}

fn cmd_compress(ws: &Workspace, all: bool) -> Result<()> {
    let graph = ws.load_graph(None, "--all")?;
    let sealed = BundlePacker::new(&ws.store, graph.as_ref())
        .with_retry(ws.config.retry_compress)
        .seal_pending(ws.config.bundle_size, all)?;
    if sealed.is_empty() {
        println!("Nothing to compress.");
    }
    for bundle in &sealed {
        println!(
            "Sealed {} ({} commits, {} bytes)",
            bundle.bundle_id,
            bundle.commits.len(),
            bundle.size_bytes
        );
    }
    let pending = ws.store.pending_bundle().len();
    if pending > 0 {
        println!("{pending} artifact(s) still pending.");
    }
    Ok(())
}

fn cmd_extract(ws: &Workspace, reference: &str, destination: Option<&Path>) -> Result<()> {
    let commit = resolve_ref(&ws.config.workspace_path, reference)?;
    let destination = destination
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("bimon-{}", commit.short())));
    ws.store
        .extract(&commit, &destination)
        .with_context(|| format!("Failed to extract {}", commit.short()))?;
    println!("✓ {} extracted to {}", commit.short(), destination.display());
    Ok(())
}

fn cmd_purge(ws: &Workspace, duplicates: bool, loose_files: bool) -> Result<()> {
    let (duplicates, loose_files) = if duplicates || loose_files {
        (duplicates, loose_files)
    } else {
        (true, true)
    };
    if duplicates {
        let removed = ws.store.deduplicate(&HashSet::new())?;
        println!("Removed {removed} duplicate artifact(s).");
    }
    if loose_files {
        let removed = ws.store.purge_loose_files()?;
        println!("Removed {removed} loose file(s).");
    }
    Ok(())
}

fn cmd_evict(ws: &Workspace, keep: Option<usize>) -> Result<()> {
    let keep = keep.unwrap_or(ws.config.lru_keep);
    let removed = ws.store.evict_lru(keep)?;
    println!("Evicted {removed} working cop(ies), kept at most {keep}.");
    Ok(())
}

fn cmd_status(ws: &Workspace, refs: &[String]) -> Result<()> {
    if refs.is_empty() {
        let lists = ws.store.lists()?;
        println!("Store:          {}", ws.store.root().display());
        println!("Cached commits: {}", ws.store.present_commits().len());
        println!("Bundles:        {}", ws.store.bundles().len());
        println!("Pending:        {}", ws.store.pending_bundle().len());
        println!("Compile errors: {}", lists.compile_errors.len());
        println!("Ignored:        {}", lists.ignored.len());
        if SessionRecord::path(ws.store.root()).exists() {
            println!("A saved bisect session can be resumed with `bimon bisect --resume`.");
        }
        return Ok(());
    }
    for reference in refs {
        let commit = resolve_ref(&ws.config.workspace_path, reference)?;
        let status = ws.store.status(&commit)?;
        println!("{}  {}", commit.short(), describe_status(&status));
    }
    Ok(())
}

struct BisectArgs {
    good: Vec<String>,
    bad: Vec<String>,
    cached_only: bool,
    include_unbuildable: bool,
    resume: bool,
    headless: bool,
    discard: bool,
    head: String,
}

async fn cmd_bisect(ws: &Workspace, args: BisectArgs) -> Result<()> {
    if !args.cached_only {
        ws.require_build()?;
    }
    // Bisection asks for the same ancestries over and over.
    let graph = Arc::new(CachedCommitGraph::new(ws.read_history(None, &args.head)?));
    let lists = ws.store.lists()?.resolved(graph.as_ref());

    let mut options = ws.config.engine_options(args.cached_only);
    options.include_unbuildable = args.include_unbuildable;
    let engine = BisectEngine::new(options)
        .with_excluded(lists.ignored.into_iter().chain(lists.compile_errors));

    let cancel = cancel_on_interrupt();
    let builder = Arc::new(CommandBuilder::from_config(&ws.config, cancel));
    let tester = CommandTester::from_config(&ws.config)?;
    let tester = if args.headless { tester.quiet() } else { tester };
    let mut runner = BisectRunner::new(
        engine,
        graph.clone(),
        ws.store.clone(),
        builder,
        Arc::new(tester),
        ws.config.automation.clone(),
        ws.config.runner_options(),
    );
    if args.resume {
        let record = SessionRecord::load(ws.store.root())?;
        runner = runner.resume(record)?;
    }
    for (refs, mark) in [(&args.good, Mark::Good), (&args.bad, Mark::Bad)] {
        for reference in refs {
            let commit = graph.resolve(reference)?;
            print_warnings(&runner.mark(&commit, mark)?);
        }
    }

    let end = if args.headless {
        match runner.run_headless().await {
            Ok(end) => Some(end),
            Err(BimonError::Aborted) => None,
            Err(BimonError::Bisect(BisectError::NotSeeded)) => Some(SessionEnd::NeedsSeed),
            Err(e) => return Err(e.into()),
        }
    } else {
        interactive(&mut runner, graph.as_ref()).await?
    };

    match &end {
        Some(SessionEnd::Found(commit)) => println!("First bad commit: {commit}"),
        Some(SessionEnd::CacheExhausted(remaining)) => {
            println!(
                "No cached commits left; {} candidates remain. Rerun without --cached-only to build them.",
                remaining.len()
            );
        }
        Some(SessionEnd::Exhausted(remaining)) => {
            println!("Only skipped commits remain; the first bad commit is one of:");
            for commit in remaining {
                println!("  {commit}");
            }
        }
        Some(SessionEnd::Contradiction(reason)) => println!("Marks contradict: {reason}"),
        Some(SessionEnd::NeedsSeed) => println!("Mark at least one good and one bad commit."),
        None => println!("Session stopped."),
    }

    let report = runner.close(args.discard).await?;
    if report.culprit.is_none() {
        let hint = report.resume_hint();
        if !hint.is_empty() {
            println!("Resume with: bimon bisect {hint}");
        }
    }
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

/// Drive the runner, prompting whenever it needs a human.
///
/// Returns `None` when the user quits or the session is interrupted.
async fn interactive(runner: &mut BisectRunner, graph: &dyn CommitGraph) -> Result<Option<SessionEnd>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let step = match runner.run_until_pause().await {
            Ok(step) => step,
            Err(BimonError::Aborted) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let current = match step {
            Step::Paused { commit, outcome } => {
                match (outcome.exit_code, outcome.signal) {
                    (_, Some(signal)) => {
                        println!("{} was killed by signal {signal}", commit.short())
                    }
                    (Some(code), None) => println!("{} exited with {code}", commit.short()),
                    (None, None) => println!("{} finished", commit.short()),
                }
                Some(commit)
            }
            Step::Finished(SessionEnd::NeedsSeed) => {
                println!("Mark at least one good and one bad commit.");
                None
            }
            Step::Finished(SessionEnd::Contradiction(reason)) => {
                println!("Marks contradict: {reason}");
                println!("Unmark one of the conflicting commits to continue.");
                None
            }
            Step::Finished(end) => return Ok(Some(end)),
            Step::Marked { .. } | Step::CompileFailed { .. } => continue,
        };
        match prompt(runner, graph, current.as_ref(), &mut lines).await? {
            Flow::Continue => {}
            Flow::Quit => return Ok(None),
        }
    }
}

/// Read commands until one changes the marks.
async fn prompt(
    runner: &mut BisectRunner,
    graph: &dyn CommitGraph,
    current: Option<&CommitId>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<Flow> {
    loop {
        print!("bimon> ");
        std::io::stdout().flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => return Ok(Flow::Quit),
        };
        let Some(line) = line else {
            return Ok(Flow::Quit);
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match input::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        match command {
            Command::Mark(mark, refs) => {
                let Some(targets) = targets(graph, current, &refs) else {
                    continue;
                };
                let mut changed = false;
                for commit in &targets {
                    match runner.mark(commit, mark) {
                        Ok(warnings) => {
                            print_warnings(&warnings);
                            changed = true;
                        }
                        Err(e) => println!("{e}"),
                    }
                }
                if changed {
                    return Ok(Flow::Continue);
                }
            }
            Command::Unmark(refs) => {
                let Some(targets) = targets(graph, current, &refs) else {
                    continue;
                };
                let mut changed = false;
                for commit in &targets {
                    match runner.unmark(commit) {
                        Ok(true) => changed = true,
                        Ok(false) => println!("{} has no mark", commit.short()),
                        Err(e) => println!("{e}"),
                    }
                }
                if changed {
                    return Ok(Flow::Continue);
                }
            }
            Command::List => {
                let range = runner.engine().range();
                println!("{} candidate(s):", range.len());
                for commit in range {
                    println!("  {commit}");
                }
            }
            Command::Help => println!("{}", input::HELP),
            Command::Quit => return Ok(Flow::Quit),
        }
    }
}

/// Resolve the named commits, or fall back to the one under test.
fn targets(graph: &dyn CommitGraph, current: Option<&CommitId>, refs: &[String]) -> Option<Vec<CommitId>> {
    if refs.is_empty() {
        if current.is_none() {
            println!("No commit under test; name one.");
        }
        return current.map(|c| vec![c.clone()]);
    }
    let mut resolved = Vec::with_capacity(refs.len());
    for reference in refs {
        match graph.resolve(reference) {
            Ok(commit) => resolved.push(commit),
            Err(e) => {
                println!("{e}");
                return None;
            }
        }
    }
    Some(resolved)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    bimon_core::init_tracing(cli.json, level);

    let ws = Workspace::open(&cli.config)?;
    info!(store = %ws.store.root().display(), "store opened");

    match cli.command {
        Commands::Compile { commits } => cmd_compile(&ws, &commits).await,
        Commands::Update {
            every,
            from,
            to,
            largest_diff,
            no_compress,
        } => cmd_update(&ws, every, from.as_deref(), &to, largest_diff, no_compress).await,
        Commands::Compress { all } => cmd_compress(&ws, all),
        Commands::Extract {
            reference,
            destination,
        } => cmd_extract(&ws, &reference, destination.as_deref()),
        Commands::Purge {
            duplicates,
            loose_files,
        } => cmd_purge(&ws, duplicates, loose_files),
        Commands::Evict { keep } => cmd_evict(&ws, keep),
        Commands::Status { commits } => cmd_status(&ws, &commits),
        Commands::Bisect {
            good,
            bad,
            cached_only,
            include_unbuildable,
            resume,
            headless,
            discard,
            head,
        } => {
            cmd_bisect(
                &ws,
                BisectArgs {
                    good,
                    bad,
                    cached_only,
                    include_unbuildable,
                    resume,
                    headless,
                    discard,
                    head,
                },
            )
            .await
        }
    }
}
