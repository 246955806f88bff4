//! Cache-aware bisection: engine state machine, automation rules, session
//! persistence and the async driver.

pub mod automation;
pub mod engine;
pub mod error;
pub mod runner;
pub mod session;

pub use automation::{
    AutomationPolicy, AutomationRule, OutcomeMatcher, OutputPattern, ProcessOutcome,
};
pub use engine::{
    AdvanceResult, BisectEngine, EngineOptions, MarkWarning, NextPick, Phase, SessionReport,
};
pub use error::BisectError;
pub use runner::{BisectRunner, RunnerOptions, SessionEnd, Step, Tester};
pub use session::{SessionMarks, SessionRecord};
