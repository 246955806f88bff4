//! Process-backed builder and tester driven by `bimon.toml`.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bimon_core::{
    BimonConfig, BimonError, BuildOutcome, Builder, CommitId, CompiledArtifact, ProcessOutcome,
    Tester,
};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable holding the commit being built or tested.
pub const COMMIT_ENV: &str = "BIMON_COMMIT";

/// Placeholder in `execution_args` replaced by the workspace path.
pub const PATH_PLACEHOLDER: &str = "{PATH}";

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

/// Checks out a commit in the workspace and runs the configured build.
pub struct CommandBuilder {
    workspace: PathBuf,
    command: Vec<String>,
    artifact_paths: Vec<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl CommandBuilder {
    pub fn from_config(config: &BimonConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            workspace: config.workspace_path.clone(),
            command: config.build_command.clone(),
            artifact_paths: config.artifact_paths.clone(),
            cancel,
        }
    }

    async fn checkout(&self, commit: &CommitId) -> Result<(), String> {
        let output = Command::new("git")
            .args(["checkout", "--force", "--quiet", commit.as_str()])
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| format!("failed to run git: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn compile(&self, commit: &CommitId) -> BuildOutcome {
        let Some((program, args)) = self.command.split_first() else {
            return BuildOutcome::Failure {
                log: "no build_command configured".into(),
            };
        };
        if self.cancelled() {
            return BuildOutcome::Aborted;
        }
        if let Err(log) = self.checkout(commit).await {
            return BuildOutcome::Failure { log };
        }

        let start = Instant::now();
        info!(commit = %commit.short(), "building");
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.workspace)
            .env(COMMIT_ENV, commit.as_str())
            .stdin(Stdio::null())
            .output()
            .await;
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return BuildOutcome::Failure {
                    log: format!("failed to start {program}: {e}"),
                }
            }
        };
        debug!(
            commit = %commit.short(),
            duration_ms = start.elapsed().as_millis() as u64,
            success = output.status.success(),
            "build finished"
        );

        if self.cancelled() {
            return BuildOutcome::Aborted;
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return BuildOutcome::Failure {
                log: last_lines(&stderr, 20),
            };
        }
        let missing: Vec<&PathBuf> = self
            .artifact_paths
            .iter()
            .filter(|p| !self.workspace.join(p).exists())
            .collect();
        if !missing.is_empty() {
            return BuildOutcome::Failure {
                log: format!("build succeeded but produced no {missing:?}"),
            };
        }
        BuildOutcome::Success(CompiledArtifact {
            source_root: self.workspace.clone(),
            paths: self.artifact_paths.clone(),
        })
    }
}

/// Runs the configured executable from an artifact directory.
pub struct CommandTester {
    workspace: PathBuf,
    executable: PathBuf,
    args: Vec<String>,
    /// Echo captured output after each run.
    echo: bool,
}

impl CommandTester {
    pub fn from_config(config: &BimonConfig) -> Result<Self, BimonError> {
        let executable = config
            .executable_path
            .clone()
            .ok_or_else(|| BimonError::Config("executable_path is not set".into()))?;
        Ok(Self {
            workspace: config.workspace_path.clone(),
            executable,
            args: config.execution_args.clone(),
            echo: true,
        })
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    fn expanded_args(&self) -> Vec<String> {
        let workspace = self.workspace.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PATH_PLACEHOLDER, &workspace))
            .collect()
    }
}

#[async_trait]
impl Tester for CommandTester {
    async fn run(&self, commit: &CommitId, artifact_dir: &Path) -> bimon_core::Result<ProcessOutcome> {
        let program = artifact_dir.join(&self.executable);
        info!(commit = %commit.short(), program = %program.display(), "running");
        let output = Command::new(&program)
            .args(self.expanded_args())
            .current_dir(artifact_dir)
            .env(COMMIT_ENV, commit.as_str())
            .stdin(Stdio::null())
            .output()
            .await?;

        let outcome = ProcessOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            signal: signal_of(&output.status),
        };
        if outcome.crashed() {
            warn!(commit = %commit.short(), signal = ?outcome.signal, "process crashed");
        }
        if self.echo {
            print!("{}", outcome.stdout);
            eprint!("{}", outcome.stderr);
        }
        Ok(outcome)
    }
}
