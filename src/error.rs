use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Coordination,
    Build,
    Vcs,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Coordination => "COORDINATION",
            ErrorCategory::Build => "BUILD",
            ErrorCategory::Vcs => "VCS",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Config => {
                "Check .foreman/config.toml (or --config) and run `foreman profiles show`."
            }
            ErrorCategory::Coordination => {
                "Inspect `foreman markers` and `foreman status show`; the ledger under the root directory records every decision."
            }
            ErrorCategory::Build => {
                "Run the configured install/check/start commands by hand in the repository directory."
            }
            ErrorCategory::Vcs => "Run `foreman doctor` and check the repository with `git status`.",
            ErrorCategory::Input => "Run foreman --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("profile")
        || msg.contains("config")
        || msg.contains("standards catalog")
        || msg.contains("ownership")
    {
        return ErrorCategory::Config;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("invalid qa report")
        || msg.contains("does not match the standards catalog")
        || msg.contains("agent ids must not")
        || msg.contains("is not allowed for agent")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("git") || msg.contains("worktree") || msg.contains("merge") {
        return ErrorCategory::Vcs;
    }

    if msg.contains("build") || msg.contains("smoke") {
        return ErrorCategory::Build;
    }

    if msg.contains("message bus")
        || msg.contains("mailbox")
        || msg.contains("status log")
        || msg.contains("ledger")
        || msg.contains("qa run")
    {
        return ErrorCategory::Coordination;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        redact_sensitive_text(&format!("{err:#}")),
        category.hint()
    )
}

const TOKEN_PREFIXES: [&str; 5] = ["ghp_", "gho_", "ghu_", "ghs_", "github_pat_"];

/// Mask GitHub tokens that leak into command output or error chains.
pub fn redact_sensitive_text(text: &str) -> String {
    text.split_inclusive(char::is_whitespace)
        .map(|chunk| {
            let word = chunk.trim_end();
            let trailing = &chunk[word.len()..];
            match TOKEN_PREFIXES
                .iter()
                .find_map(|prefix| word.find(prefix).map(|at| (at, *prefix)))
            {
                Some((at, prefix)) => format!("{}{}[REDACTED]{}", &word[..at], prefix, trailing),
                None => chunk.to_string(),
            }
        })
        .collect()
}

/// Protocol-level failures the supervisor distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Trunk does not build before any worker starts. Fatal.
    ScaffoldFailure,
    /// A feature branch does not merge cleanly. Fatal to the run.
    MergeConflict,
    /// Merged trunk does not build. Routed back as a fix task.
    BuildVerificationFailure,
    /// One or more standards failed. Routed back per standard.
    QaFailure,
    WorkerBlocked,
    MalformedMessage,
    PrCreationFailure,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            FailureKind::ScaffoldFailure => "SCAFFOLD_FAILURE",
            FailureKind::MergeConflict => "MERGE_CONFLICT",
            FailureKind::BuildVerificationFailure => "BUILD_VERIFICATION_FAILURE",
            FailureKind::QaFailure => "QA_FAILURE",
            FailureKind::WorkerBlocked => "WORKER_BLOCKED",
            FailureKind::MalformedMessage => "MALFORMED_MESSAGE",
            FailureKind::PrCreationFailure => "PR_CREATION_FAILURE",
        }
    }

    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            FailureKind::BuildVerificationFailure | FailureKind::QaFailure
        )
    }

    pub fn hint(self) -> &'static str {
        match self {
            FailureKind::ScaffoldFailure => {
                "Fix the trunk so the build commands pass before starting workers."
            }
            FailureKind::MergeConflict => {
                "Rebase the conflicting feature branch onto trunk, then run again."
            }
            FailureKind::BuildVerificationFailure => {
                "A build fix task was assigned; workers re-report COMPLETE when fixed."
            }
            FailureKind::QaFailure => "Fix tasks were assigned for every failing standard.",
            FailureKind::WorkerBlocked => "A worker needs help; read its status note.",
            FailureKind::MalformedMessage => "A malformed bus record was skipped.",
            FailureKind::PrCreationFailure => {
                "Open the pull request by hand; the run itself is complete."
            }
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
