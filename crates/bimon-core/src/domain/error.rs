//! Domain-level error taxonomy for BiMon.

use crate::bisect::error::BisectError;
use crate::prefetch::PrefetchError;
use crate::store::StoreError;

/// BiMon domain errors.
#[derive(Debug, thiserror::Error)]
pub enum BimonError {
    #[error("invalid commit hash: {0}")]
    InvalidCommit(String),

    #[error("unknown commit: {0}")]
    UnknownCommit(String),

    #[error("invalid mark: {0} (expected good, bad or skip)")]
    InvalidMark(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bisect error: {0}")]
    Bisect(#[from] BisectError),

    #[error("prefetch error: {0}")]
    Prefetch(#[from] PrefetchError),

    #[error("aborted by user")]
    Aborted,

    #[error("git error: {0}")]
    GitError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for BiMon domain operations.
pub type Result<T> = std::result::Result<T, BimonError>;
