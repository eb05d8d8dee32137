//! Pull request publication once a run completes.
//!
//! Publication is best effort: every precondition that does not hold is a
//! clean skip, and a failing command is reported but never blocks completion.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::PullRequestSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrError {
    pub code: &'static str,
    pub message: String,
}

impl PrError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrOutcome {
    Skipped { reason: String },
    Created { url: String },
    Failed { error: String },
}

impl fmt::Display for PrOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            PrOutcome::Created { url } => write!(f, "created: {url}"),
            PrOutcome::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRequest {
    pub title: String,
    pub body: String,
    /// Branch carrying the merged work.
    pub head: String,
}

#[async_trait]
pub trait PrPublisher: Send + Sync {
    async fn publish(&self, request: &PrRequest) -> PrOutcome;
}

pub fn github_token_present() -> bool {
    ["GH_TOKEN", "GITHUB_TOKEN"].iter().any(|key| {
        std::env::var(key)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    })
}

/// Host part of a git remote URL (`https://host/...`, `ssh://user@host/...`
/// or scp-like `user@host:path`).
pub fn remote_host(url: &str) -> Option<String> {
    let url = url.trim();
    let host = if let Some((_, rest)) = url.split_once("://") {
        let authority = rest.split('/').next()?;
        let authority = authority.rsplit('@').next()?;
        authority.split(':').next()?
    } else {
        let (before, _) = url.split_once(':')?;
        before.rsplit('@').next()?
    };
    let host = host.trim().to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

fn display_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program];
    parts.extend(args.iter().map(String::as_str));
    shlex::try_join(parts.iter().copied()).unwrap_or_else(|_| parts.join(" "))
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

pub fn build_pr_create_args(
    settings: &PullRequestSettings,
    request: &PrRequest,
    base: &str,
) -> Vec<String> {
    let mut command = strings(&["pr", "create", "--title"]);
    command.push(request.title.clone());
    command.push("--body".to_string());
    command.push(request.body.clone());
    command.push("--head".to_string());
    command.push(request.head.clone());
    command.push("--base".to_string());
    command.push(base.to_string());
    if settings.draft {
        command.push("--draft".to_string());
    }
    command
}

/// Default branch of the repository the GitHub CLI resolves from the
/// working directory.
fn default_branch<F>(runner: &mut F) -> Option<String>
where
    F: FnMut(&str, &[String]) -> Result<CommandOutput, PrError>,
{
    let args = strings(&[
        "repo",
        "view",
        "--json",
        "defaultBranchRef",
        "-q",
        ".defaultBranchRef.name",
    ]);
    let output = runner("gh", &args).ok().filter(|output| output.success)?;
    let branch = output.stdout.trim();
    (!branch.is_empty()).then(|| branch.to_string())
}

pub fn publish_with_runner<F>(
    settings: &PullRequestSettings,
    request: &PrRequest,
    token_present: bool,
    mut runner: F,
) -> PrOutcome
where
    F: FnMut(&str, &[String]) -> Result<CommandOutput, PrError>,
{
    if !settings.enabled {
        return PrOutcome::Skipped {
            reason: "pull request creation is disabled".to_string(),
        };
    }

    match runner("gh", &strings(&["--version"])) {
        Ok(output) if output.success => {}
        Ok(_) => {
            return PrOutcome::Skipped {
                reason: "GitHub CLI 'gh' is not usable".to_string(),
            };
        }
        Err(err) => {
            return PrOutcome::Skipped {
                reason: err.message,
            };
        }
    }

    if !token_present {
        let auth_ok = runner("gh", &strings(&["auth", "status"]))
            .map(|out| out.success)
            .unwrap_or(false);
        if !auth_ok {
            return PrOutcome::Skipped {
                reason: "GitHub auth not detected. Set GH_TOKEN/GITHUB_TOKEN or run `gh auth login`."
                    .to_string(),
            };
        }
    }

    let remote_url = match runner("git", &strings(&["remote", "get-url", &settings.remote])) {
        Ok(output) if output.success && !output.stdout.trim().is_empty() => {
            output.stdout.trim().to_string()
        }
        _ => {
            return PrOutcome::Skipped {
                reason: format!("no git remote named '{}' is configured", settings.remote),
            };
        }
    };

    let Some(host) = remote_host(&remote_url) else {
        return PrOutcome::Skipped {
            reason: format!("cannot determine the host of remote '{remote_url}'"),
        };
    };
    if !settings
        .supported_hosts
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(&host))
    {
        return PrOutcome::Skipped {
            reason: format!("remote host '{host}' is not a supported hosting service"),
        };
    }

    let base = match settings.base.as_deref().map(str::trim) {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => match default_branch(&mut runner) {
            Some(branch) => branch,
            None => {
                return PrOutcome::Skipped {
                    reason: "cannot determine the remote default branch; set pull_request.base"
                        .to_string(),
                };
            }
        },
    };
    if base == request.head {
        return PrOutcome::Skipped {
            reason: format!(
                "trunk '{}' is also the pull request base; set pull_request.base to another branch",
                request.head
            ),
        };
    }

    let push = strings(&["push", &settings.remote, &request.head]);
    match runner("git", &push) {
        Ok(output) if output.success => {}
        Ok(output) => {
            return PrOutcome::Failed {
                error: format!(
                    "`{}` exited with status {}: {}",
                    display_command("git", &push),
                    output.exit_code,
                    output.stderr.trim()
                ),
            };
        }
        Err(err) => {
            return PrOutcome::Failed {
                error: err.message,
            };
        }
    }

    let create = build_pr_create_args(settings, request, &base);
    match runner("gh", &create) {
        Ok(output) if output.success => {
            let url = output
                .stdout
                .lines()
                .map(str::trim)
                .rfind(|line| !line.is_empty())
                .unwrap_or_default()
                .to_string();
            PrOutcome::Created { url }
        }
        Ok(output) => PrOutcome::Failed {
            error: format!(
                "gh pr create exited with non-zero status {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        },
        Err(err) => PrOutcome::Failed {
            error: err.message,
        },
    }
}

pub fn run_command(workdir: &Path, program: &str, args: &[String]) -> Result<CommandOutput, PrError> {
    tracing::debug!(command = %display_command(program, args), "running publication command");
    let output = std::process::Command::new(program)
        .args(args)
        .current_dir(workdir)
        .output()
        .map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                PrError::new(
                    "command_missing",
                    format!("'{program}' was not found on PATH"),
                )
            } else {
                PrError::new("io_error", format!("failed to run {program}: {err}"))
            }
        })?;

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Publishes through the GitHub CLI from the repository directory.
#[derive(Debug, Clone)]
pub struct GhPublisher {
    repo_dir: PathBuf,
    settings: PullRequestSettings,
}

impl GhPublisher {
    pub fn new(repo_dir: PathBuf, settings: PullRequestSettings) -> Self {
        Self { repo_dir, settings }
    }
}

#[async_trait]
impl PrPublisher for GhPublisher {
    async fn publish(&self, request: &PrRequest) -> PrOutcome {
        let repo_dir = self.repo_dir.clone();
        let settings = self.settings.clone();
        let request = request.clone();
        let joined = tokio::task::spawn_blocking(move || {
            publish_with_runner(&settings, &request, github_token_present(), |program, args| {
                run_command(&repo_dir, program, args)
            })
        })
        .await;
        joined.unwrap_or_else(|err| PrOutcome::Failed {
            error: format!("publication task failed: {err}"),
        })
    }
}
