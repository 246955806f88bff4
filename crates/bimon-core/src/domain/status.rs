//! Artifact locations and per-commit build status.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where the authoritative artifact for a commit lives.
///
/// A commit has at most one non-`Absent` location at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactLocation {
    /// Uncompressed directory tree, directly usable.
    Raw { path: PathBuf },
    /// Slice `index` of the sealed bundle `bundle_id`.
    Bundled { bundle_id: String, index: usize },
    Absent,
}

impl ArtifactLocation {
    pub fn is_present(&self) -> bool {
        !matches!(self, ArtifactLocation::Absent)
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ArtifactLocation::Raw { .. })
    }

    pub fn is_bundled(&self) -> bool {
        matches!(self, ArtifactLocation::Bundled { .. })
    }
}

/// Build status of a commit as seen by scheduling.
///
/// Precedence when several facts hold: `Ignored` > `CompileError` >
/// `Cached` > `Unbuilt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildStatus {
    Unbuilt,
    Cached { location: ArtifactLocation },
    CompileError,
    Ignored,
}

impl BuildStatus {
    /// Whether automatic scheduling may pick this commit.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, BuildStatus::Unbuilt | BuildStatus::Cached { .. })
    }
}
