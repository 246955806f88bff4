//! Plain-text commit lists: the manual ignore list and classified compile errors.
//!
//! One or more whitespace-separated hashes per line so the files stay easy
//! to edit by hand. Unparseable tokens are skipped with a warning.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::warn;

use crate::domain::{ArtifactLocation, BuildStatus, CommitId};
use crate::graph::CommitGraph;

use super::{Result, StoreError};

/// Externally maintained list of commits never to schedule.
pub const IGNORE_FILE: &str = "ignored_commits";

/// Commits whose compile failures were classified as commit-specific.
pub const COMPILE_ERROR_FILE: &str = "compile_error_commits";

const FULL_HASH_LEN: usize = 40;

/// Read a commit list; a missing file is an empty list.
pub fn read_commit_list(path: &Path) -> Result<BTreeSet<CommitId>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let mut commits = BTreeSet::new();
    for token in text.split_whitespace() {
        match CommitId::new(token) {
            Ok(commit) => {
                commits.insert(commit);
            }
            Err(_) => warn!(file = %path.display(), token, "skipping invalid commit in list"),
        }
    }
    Ok(commits)
}

/// Rewrite a commit list atomically, one hash per line.
pub fn write_commit_list(path: &Path, commits: &BTreeSet<CommitId>) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut body = String::new();
    for commit in commits {
        body.push_str(commit.as_str());
        body.push('\n');
    }
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    std::io::Write::write_all(&mut tmp, body.as_bytes()).map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Snapshot of the two scheduling exclusion lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitLists {
    pub ignored: BTreeSet<CommitId>,
    pub compile_errors: BTreeSet<CommitId>,
}

impl CommitLists {
    pub fn load(root: &Path) -> Result<Self> {
        Ok(Self {
            ignored: read_commit_list(&root.join(IGNORE_FILE))?,
            compile_errors: read_commit_list(&root.join(COMPILE_ERROR_FILE))?,
        })
    }

    /// Combine these facts with an artifact location into a [`BuildStatus`].
    pub fn status(&self, commit: &CommitId, location: ArtifactLocation) -> BuildStatus {
        if self.ignored.contains(commit) {
            BuildStatus::Ignored
        } else if self.compile_errors.contains(commit) {
            BuildStatus::CompileError
        } else if location.is_present() {
            BuildStatus::Cached { location }
        } else {
            BuildStatus::Unbuilt
        }
    }

    /// Whether automatic scheduling must avoid `commit`.
    pub fn excludes(&self, commit: &CommitId) -> bool {
        self.ignored.contains(commit) || self.compile_errors.contains(commit)
    }

    /// Expand abbreviated hashes to the full ids `graph` knows.
    ///
    /// Entries that do not resolve to exactly one commit are dropped with
    /// a warning, since they could never match a scheduled commit.
    pub fn resolved(self, graph: &dyn CommitGraph) -> Self {
        Self {
            ignored: resolve_list(IGNORE_FILE, self.ignored, graph),
            compile_errors: resolve_list(COMPILE_ERROR_FILE, self.compile_errors, graph),
        }
    }
}

fn resolve_list(
    file: &str,
    commits: BTreeSet<CommitId>,
    graph: &dyn CommitGraph,
) -> BTreeSet<CommitId> {
    let mut resolved = BTreeSet::new();
    for commit in commits {
        if commit.as_str().len() >= FULL_HASH_LEN {
            resolved.insert(commit);
            continue;
        }
        match graph.resolve(commit.as_str()) {
            Ok(full) => {
                resolved.insert(full);
            }
            Err(e) => warn!(file, commit = %commit, error = %e, "ignoring unresolvable list entry"),
        }
    }
    resolved
}
