//! Git integration: ref resolution and a git-backed [`CommitGraph`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::domain::error::{BimonError, Result};
use crate::domain::CommitId;
use crate::graph::{CommitGraph, MemoryCommitGraph};

fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| BimonError::GitError(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BimonError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Resolve any git reference to a full commit hash.
pub fn resolve_ref(repo_dir: &Path, reference: &str) -> Result<CommitId> {
    let spec = format!("{reference}^{{commit}}");
    let sha = run_git(repo_dir, &["rev-parse", "--verify", "--quiet", &spec])
        .map_err(|_| BimonError::UnknownCommit(reference.to_string()))?;
    CommitId::new(sha)
}

/// Parse `git diff --shortstat` output into insertions + deletions.
pub(crate) fn parse_shortstat(stat: &str) -> u64 {
    stat.split(',')
        .filter(|part| part.contains("insertion") || part.contains("deletion"))
        .filter_map(|part| part.split_whitespace().next()?.parse::<u64>().ok())
        .sum()
}

/// Commit graph loaded once from `git rev-list --parents`.
///
/// Ancestry and ordering are answered from memory; ref resolution and diff
/// sizes shell out to git.
pub struct GitCommitGraph {
    repo_dir: PathBuf,
    graph: MemoryCommitGraph,
}

impl GitCommitGraph {
    /// Load the history reachable from `range_end`, excluding everything
    /// reachable from `range_start` when given.
    pub fn load(repo_dir: &Path, range_start: Option<&str>, range_end: &str) -> Result<Self> {
        let exclude = range_start.map(|start| format!("^{start}"));
        let mut args = vec!["rev-list", "--parents", "--topo-order", "--reverse", range_end];
        if let Some(exclude) = exclude.as_deref() {
            args.push(exclude);
        }
        let listing = run_git(repo_dir, &args)?;

        let mut graph = MemoryCommitGraph::new();
        for line in listing.lines().filter(|l| !l.trim().is_empty()) {
            let mut hashes = line.split_whitespace().map(CommitId::new);
            let commit = match hashes.next() {
                Some(c) => c?,
                None => continue,
            };
            let parents = hashes.collect::<Result<Vec<_>>>()?;
            graph.add_commit(commit, &parents)?;
        }
        debug!(commits = graph.len(), range_end, "loaded git history");

        Ok(Self {
            repo_dir: repo_dir.to_path_buf(),
            graph,
        })
    }

    pub fn commits(&self) -> &[CommitId] {
        self.graph.commits()
    }
}

impl CommitGraph for GitCommitGraph {
    fn resolve(&self, reference: &str) -> Result<CommitId> {
        resolve_ref(&self.repo_dir, reference)
    }

    fn parents(&self, commit: &CommitId) -> Result<Vec<CommitId>> {
        self.graph.parents(commit)
    }

    fn ancestors(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
        self.graph.ancestors(commit)
    }

    fn descendants(&self, commit: &CommitId) -> Result<HashSet<CommitId>> {
        self.graph.descendants(commit)
    }

    fn linear_order(&self, commits: &[CommitId]) -> Result<Vec<CommitId>> {
        self.graph.linear_order(commits)
    }

    fn diff_size(&self, a: &CommitId, b: &CommitId) -> Result<u64> {
        let stat = run_git(&self.repo_dir, &["diff", "--shortstat", a.as_str(), b.as_str()])?;
        Ok(parse_shortstat(&stat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command as StdCommand;

    fn git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo(commits: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init"]);
        git(dir.path(), &["config", "user.name", "test-user"]);
        git(dir.path(), &["config", "user.email", "test@example.com"]);
        for i in 0..commits {
            std::fs::write(dir.path().join("file.txt"), format!("line {i}\n")).unwrap();
            git(dir.path(), &["add", "file.txt"]);
            git(dir.path(), &["commit", "-m", &format!("commit {i}")]);
        }
        dir
    }

    #[test]
    fn is_git_repo_true_for_repo() {
        let repo = make_git_repo(1);
        assert!(is_git_repo(repo.path()));
    }

    #[test]
    fn is_git_repo_false_for_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
    }

    #[test]
    fn git_graph_loads_linear_history() {
        let repo = make_git_repo(4);
        let graph = GitCommitGraph::load(repo.path(), None, "HEAD").unwrap();
        assert_eq!(graph.commits().len(), 4);

        let head = graph.resolve("HEAD").unwrap();
        assert_eq!(head, graph.commits()[3]);
        assert_eq!(graph.ancestors(&head).unwrap().len(), 3);

        let first = graph.commits()[0].clone();
        assert_eq!(graph.diff_size(&first, &head).unwrap(), 2);
    }

    #[test]
    fn resolve_unknown_ref_fails() {
        let repo = make_git_repo(1);
        assert!(matches!(
            resolve_ref(repo.path(), "no-such-branch"),
            Err(BimonError::UnknownCommit(_))
        ));
    }

    #[test]
    fn shortstat_parsing() {
        assert_eq!(
            parse_shortstat(" 3 files changed, 10 insertions(+), 4 deletions(-)"),
            14
        );
        assert_eq!(parse_shortstat(" 1 file changed, 1 deletion(-)"), 1);
        assert_eq!(parse_shortstat(""), 0);
    }
}
