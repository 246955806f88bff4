//! Automation rules: map an observed test run to a mark without asking.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::BisectError;
use crate::domain::Mark;

/// What a test run of one commit produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn killed(signal: i32) -> Self {
        Self {
            signal: Some(signal),
            ..Self::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn crashed(&self) -> bool {
        self.signal.is_some()
    }

    fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().chain(self.stderr.lines())
    }
}

/// Regex compiled once, when the rule is built or read from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputPattern(Regex);

impl OutputPattern {
    pub fn new(pattern: &str) -> Result<Self, BisectError> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|e| BisectError::InvalidRule(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.0.is_match(line)
    }
}

impl TryFrom<String> for OutputPattern {
    type Error = BisectError;

    fn try_from(pattern: String) -> Result<Self, Self::Error> {
        Self::new(&pattern)
    }
}

impl From<OutputPattern> for String {
    fn from(pattern: OutputPattern) -> Self {
        pattern.as_str().to_string()
    }
}

impl PartialEq for OutputPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for OutputPattern {}

/// Condition over a [`ProcessOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeMatcher {
    /// Literal substring of stdout or stderr.
    OutputContains { text: String },
    /// Regex matched line by line against stdout and stderr.
    OutputMatches { pattern: OutputPattern },
    ExitCode { code: i32 },
    Signal { signal: i32 },
    /// Killed by any signal.
    Crashed,
}

impl OutcomeMatcher {
    pub fn matches(&self, outcome: &ProcessOutcome) -> bool {
        match self {
            OutcomeMatcher::OutputContains { text } => {
                outcome.stdout.contains(text.as_str()) || outcome.stderr.contains(text.as_str())
            }
            OutcomeMatcher::OutputMatches { pattern } => {
                outcome.output_lines().any(|line| pattern.is_match(line))
            }
            OutcomeMatcher::ExitCode { code } => outcome.exit_code == Some(*code),
            OutcomeMatcher::Signal { signal } => outcome.signal == Some(*signal),
            OutcomeMatcher::Crashed => outcome.crashed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub when: OutcomeMatcher,
    pub mark: Mark,
}

impl AutomationRule {
    pub fn new(when: OutcomeMatcher, mark: Mark) -> Self {
        Self { when, mark }
    }
}

/// Ordered rules evaluated first-match-wins.
///
/// No match means the session pauses for manual input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationPolicy {
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
}

impl AutomationPolicy {
    /// No rules: every outcome needs a human.
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: AutomationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn is_manual(&self) -> bool {
        self.rules.is_empty()
    }

    /// Reject rules that match every outcome by accident.
    ///
    /// Patterns are already compiled; an empty substring or pattern would
    /// shadow every rule after it.
    pub fn validate(&self) -> Result<(), BisectError> {
        for (i, rule) in self.rules.iter().enumerate() {
            let empty = match &rule.when {
                OutcomeMatcher::OutputContains { text } => text.is_empty(),
                OutcomeMatcher::OutputMatches { pattern } => pattern.as_str().is_empty(),
                _ => false,
            };
            if empty {
                return Err(BisectError::InvalidRule(format!(
                    "rule {i}: empty output condition"
                )));
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, outcome: &ProcessOutcome) -> Option<Mark> {
        self.rules
            .iter()
            .find(|rule| rule.when.matches(outcome))
            .map(|rule| rule.mark)
    }

    /// Crash is bad, clean exit is good, anything else is skipped.
    pub fn crash_detection() -> Self {
        Self::manual()
            .with_rule(AutomationRule::new(OutcomeMatcher::Crashed, Mark::Bad))
            .with_rule(AutomationRule::new(
                OutcomeMatcher::ExitCode { code: 0 },
                Mark::Good,
            ))
    }
}
