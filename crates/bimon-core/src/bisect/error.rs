//! Errors specific to bisection sessions.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BisectError {
    /// The marks cannot all be true at once; unmark or restart.
    #[error("contradictory marks: {0}")]
    Contradiction(String),

    #[error("bisect needs at least one good and one bad commit")]
    NotSeeded,

    #[error("invalid automation rule: {0}")]
    InvalidRule(String),

    #[error("no saved bisect session at {0}")]
    NoSession(String),
}
