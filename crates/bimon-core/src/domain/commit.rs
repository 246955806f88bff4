//! Commit identifiers and bisection labels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{BimonError, Result};

/// Full hex hash identifying a commit.
///
/// Always stored lowercase so that lookups are case-insensitive with
/// respect to user input.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// Validate and normalize a hex commit hash.
    pub fn new(hash: impl AsRef<str>) -> Result<Self> {
        let hash = hash.as_ref().trim();
        if hash.len() < 4 || hash.len() > 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BimonError::InvalidCommit(hash.to_string()));
        }
        Ok(Self(hash.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 10 characters, the length used in log output.
    pub fn short(&self) -> &str {
        &self.0[..10.min(self.0.len())]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.short())
    }
}

impl FromStr for CommitId {
    type Err = BimonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CommitId {
    type Error = BimonError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CommitId> for String {
    fn from(value: CommitId) -> Self {
        value.0
    }
}

/// Verdict recorded against a commit during a bisection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mark {
    Good,
    Bad,
    Skip,
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mark::Good => "good",
            Mark::Bad => "bad",
            Mark::Skip => "skip",
        };
        f.write_str(s)
    }
}

impl FromStr for Mark {
    type Err = BimonError;

    /// Accepts any unique prefix, so `g`, `go` and `good` all parse.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return Err(BimonError::InvalidMark(s.to_string()));
        }
        for (word, mark) in [("good", Mark::Good), ("bad", Mark::Bad), ("skip", Mark::Skip)] {
            if word.starts_with(&lower) {
                return Ok(mark);
            }
        }
        Err(BimonError::InvalidMark(s.to_string()))
    }
}
