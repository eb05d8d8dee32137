//! Git plumbing: feature worktree setup and merging branches into trunk.
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::Feature;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsError {
    pub code: &'static str,
    pub message: String,
}

impl VcsError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for VcsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "git {}: {}", self.code, self.message)
    }
}

impl std::error::Error for VcsError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub async fn run_git(repo_dir: &Path, args: &[&str]) -> Result<GitOutput, VcsError> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(repo_dir)
        .args(args)
        .output()
        .await
        .map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                VcsError::new("git_missing", "git was not found on PATH. Install git and retry.")
            } else {
                VcsError::new("io_error", format!("failed to run git: {err}"))
            }
        })?;

    Ok(GitOutput {
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn command_failed(args: &[&str], output: &GitOutput) -> VcsError {
    VcsError::new(
        "command_failed",
        format!(
            "`git {}` exited with status {}: {}",
            args.join(" "),
            output.exit_code,
            output.stderr.trim()
        ),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict { details: String },
}

/// Merges one feature branch into the trunk. Conflicts are reported, never
/// resolved; the trunk is left as it was before the attempt.
#[async_trait]
pub trait Merger: Send + Sync {
    async fn merge(&self, feature: &Feature) -> Result<MergeOutcome, VcsError>;
}

#[derive(Debug, Clone)]
pub struct GitMerger {
    repo_dir: PathBuf,
    trunk: String,
}

impl GitMerger {
    pub fn new(repo_dir: PathBuf, trunk: String) -> Self {
        Self { repo_dir, trunk }
    }
}

#[async_trait]
impl Merger for GitMerger {
    async fn merge(&self, feature: &Feature) -> Result<MergeOutcome, VcsError> {
        let checkout = ["checkout", self.trunk.as_str()];
        let output = run_git(&self.repo_dir, &checkout).await?;
        if !output.success {
            return Err(command_failed(&checkout, &output));
        }

        let message = format!("Merge feature '{}' into {}", feature.name, self.trunk);
        let merge = [
            "merge",
            "--no-ff",
            "-m",
            message.as_str(),
            feature.branch.as_str(),
        ];
        let output = run_git(&self.repo_dir, &merge).await?;
        if output.success {
            tracing::info!(feature = %feature.name, branch = %feature.branch, "merged feature branch");
            return Ok(MergeOutcome::Merged);
        }

        let unmerged = run_git(
            &self.repo_dir,
            &["diff", "--name-only", "--diff-filter=U"],
        )
        .await?;
        let conflicted = unmerged
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if conflicted.is_empty() {
            return Err(command_failed(&merge, &output));
        }

        let abort = run_git(&self.repo_dir, &["merge", "--abort"]).await?;
        if !abort.success {
            tracing::warn!(stderr = %abort.stderr.trim(), "git merge --abort failed");
        }
        Ok(MergeOutcome::Conflict {
            details: format!("conflicting files: {}", conflicted.join(", ")),
        })
    }
}

pub async fn branch_exists(repo_dir: &Path, branch: &str) -> Result<bool, VcsError> {
    let reference = format!("refs/heads/{branch}");
    let output = run_git(
        repo_dir,
        &["rev-parse", "--verify", "--quiet", reference.as_str()],
    )
    .await?;
    Ok(output.success)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeSetup {
    Created,
    Attached,
    AlreadyPresent,
}

/// Give a feature its own branch and working directory off the trunk.
pub async fn ensure_worktree(
    repo_dir: &Path,
    trunk: &str,
    feature: &Feature,
) -> Result<WorktreeSetup, VcsError> {
    if feature.directory.exists() {
        return Ok(WorktreeSetup::AlreadyPresent);
    }
    let directory = feature.directory.display().to_string();

    let (setup, args) = if branch_exists(repo_dir, &feature.branch).await? {
        (
            WorktreeSetup::Attached,
            vec!["worktree", "add", directory.as_str(), feature.branch.as_str()],
        )
    } else {
        (
            WorktreeSetup::Created,
            vec![
                "worktree",
                "add",
                "-b",
                feature.branch.as_str(),
                directory.as_str(),
                trunk,
            ],
        )
    };

    let output = run_git(repo_dir, &args).await?;
    if !output.success {
        return Err(command_failed(&args, &output));
    }
    Ok(setup)
}
