//! Build verification: install, compile/typecheck and smoke-start.
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::BuildSettings;

pub const GATE_MAX_LOG_CHARS: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    /// Unmodified trunk, before any worker starts.
    Scaffold,
    /// Trunk after every feature branch was merged.
    PostMerge,
}

impl GateStage {
    pub fn label(self) -> &'static str {
        match self {
            GateStage::Scaffold => "scaffold",
            GateStage::PostMerge => "post-merge",
        }
    }

    fn smoke_start(self) -> bool {
        matches!(self, GateStage::PostMerge)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub ok: bool,
    pub log: String,
}

impl GateReport {
    pub fn pass(log: impl Into<String>) -> Self {
        Self {
            ok: true,
            log: log.into(),
        }
    }

    pub fn fail(log: impl Into<String>) -> Self {
        Self {
            ok: false,
            log: log.into(),
        }
    }
}

/// Verifies the trunk as it is at call time. Implementations must leave no
/// processes running and must not modify the repository.
#[async_trait]
pub trait BuildGate: Send + Sync {
    async fn verify(&self, stage: GateStage) -> GateReport;
}

/// Keep the last `max_chars` characters; build logs fail at the bottom.
pub fn tail_text(text: &str, max_chars: usize) -> (String, bool) {
    let count = text.chars().count();
    if count <= max_chars {
        return (text.to_string(), false);
    }
    let tail = text.chars().skip(count - max_chars).collect::<String>();
    (format!("... truncated\n{tail}"), true)
}

/// Runs the configured shell commands inside the repository directory.
#[derive(Debug, Clone)]
pub struct ShellBuildGate {
    workdir: PathBuf,
    settings: BuildSettings,
    log_dir: PathBuf,
}

impl ShellBuildGate {
    pub fn new(workdir: PathBuf, settings: BuildSettings, log_dir: PathBuf) -> Self {
        Self {
            workdir,
            settings,
            log_dir,
        }
    }

    fn shell(&self, command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn run_step(&self, step: &str, command: &str, log: &mut String) -> bool {
        let start = Instant::now();
        log.push_str(&format!("$ {command}\n"));

        let mut cmd = self.shell(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let outcome = tokio::time::timeout(self.settings.command_timeout, cmd.output()).await;

        let ok = match outcome {
            Ok(Ok(output)) => {
                log.push_str(&String::from_utf8_lossy(&output.stdout));
                log.push_str(&String::from_utf8_lossy(&output.stderr));
                if !output.status.success() {
                    log.push_str(&format!(
                        "{step} exited with non-zero status: {}\n",
                        output.status
                    ));
                }
                output.status.success()
            }
            Ok(Err(err)) => {
                log.push_str(&format!("failed to launch {step} command: {err}\n"));
                false
            }
            Err(_) => {
                log.push_str(&format!(
                    "{step} timed out after {}s\n",
                    self.settings.command_timeout.as_secs()
                ));
                false
            }
        };

        tracing::info!(
            step = step,
            ok,
            duration_ms = start.elapsed().as_millis() as u64,
            "build gate step finished"
        );
        ok
    }

    /// Start the service and require it to survive the grace period.
    async fn smoke_start(&self, command: &str, log: &mut String) -> bool {
        log.push_str(&format!(
            "$ {command} (smoke start, grace {}s)\n",
            self.settings.smoke_grace.as_secs()
        ));

        if let Err(err) = std::fs::create_dir_all(&self.log_dir) {
            log.push_str(&format!("failed to create smoke log directory: {err}\n"));
            return false;
        }
        let log_path = self.log_dir.join("smoke-start.log");
        let (stdout, stderr) = match std::fs::File::create(&log_path)
            .and_then(|file| file.try_clone().map(|clone| (file, clone)))
        {
            Ok(files) => files,
            Err(err) => {
                log.push_str(&format!(
                    "failed to open smoke log '{}': {err}\n",
                    log_path.display()
                ));
                return false;
            }
        };

        let mut cmd = self.shell(command);
        cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                log.push_str(&format!("failed to launch start command: {err}\n"));
                return false;
            }
        };

        let pid = child.id();
        let survived = match tokio::time::timeout(self.settings.smoke_grace, child.wait()).await {
            Ok(Ok(status)) => {
                log.push_str(&format!(
                    "service exited during grace period with status {status}\n"
                ));
                false
            }
            Ok(Err(err)) => {
                log.push_str(&format!("failed to wait for service: {err}\n"));
                false
            }
            Err(_) => true,
        };

        stop_process_tree(&mut child, pid).await;

        let output = std::fs::read_to_string(&log_path).unwrap_or_default();
        log.push_str(&output);
        if survived {
            log.push_str("service survived the grace period; stopped\n");
        }
        survived
    }
}

async fn stop_process_tree(child: &mut tokio::process::Child, pid: Option<u32>) {
    // The service runs in its own process group; signal the whole group so
    // that children of the shell (dev servers, watchers) go down too.
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            let _ = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(format!("-{pid}"))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

#[async_trait]
impl BuildGate for ShellBuildGate {
    async fn verify(&self, stage: GateStage) -> GateReport {
        let mut log = String::new();
        let steps = [
            ("install", self.settings.install.as_deref()),
            ("check", self.settings.check.as_deref()),
        ];

        let mut ok = true;
        for (step, command) in steps {
            let Some(command) = command else {
                continue;
            };
            if !self.run_step(step, command, &mut log).await {
                ok = false;
                break;
            }
        }

        if ok
            && stage.smoke_start()
            && let Some(start) = self.settings.start.as_deref()
        {
            ok = self.smoke_start(start, &mut log).await;
        }

        if log.is_empty() {
            log.push_str("no build commands configured\n");
        }
        let (log, _) = tail_text(&log, GATE_MAX_LOG_CHARS);
        tracing::info!(stage = stage.label(), ok, "build gate finished");
        GateReport { ok, log }
    }
}
