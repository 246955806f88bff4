//! BiMon Core Library
//!
//! Commit-indexed artifact cache and cache-aware regression bisection.
//! Re-exports the main components for programmatic use.

pub mod bisect;
pub mod builder;
pub mod config;
pub mod domain;
pub mod git;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod packer;
pub mod precompile;
pub mod prefetch;
pub mod store;
pub mod telemetry;

pub use bisect::{
    AdvanceResult, AutomationPolicy, AutomationRule, BisectEngine, BisectError, BisectRunner,
    EngineOptions, MarkWarning, NextPick, OutcomeMatcher, OutputPattern, Phase, ProcessOutcome,
    RunnerOptions, SessionEnd, SessionRecord, SessionReport, Step, Tester,
};

pub use builder::{BuildOutcome, Builder, CompileGate, CompiledArtifact};

pub use config::BimonConfig;

pub use domain::{ArtifactLocation, BimonError, BuildStatus, CommitId, Mark, Result};

pub use git::{is_git_repo, resolve_ref, GitCommitGraph};

pub use graph::{CachedCommitGraph, CommitGraph, MemoryCommitGraph};

pub use packer::BundlePacker;

pub use precompile::{
    EverySample, EvenlySpaced, LargestDiffFirst, PrecompileOptions, PrecompileReport,
    Precompiler, SamplingStrategy,
};

pub use prefetch::{PrefetchError, PrefetchPool};

pub use store::{ArtifactCatalog, ArtifactStore, SealedBundle, StoreError, StoreOptions};

pub use telemetry::init_tracing;

/// BiMon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
