use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::status::AgentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildFailureRouting {
    All,
    LastMerged,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum StatusCommands {
    #[command(about = "Append a lifecycle status entry for an agent")]
    Set {
        #[arg(long)]
        agent: String,
        #[arg(value_enum)]
        state: AgentState,
        note: Vec<String>,
    },
    #[command(about = "Show the latest status of every registered feature")]
    Show {
        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum QaCommands {
    #[command(about = "Validate and store a QA report, then send QA_RESULT to the supervisor")]
    Submit {
        #[arg(long)]
        report: String,
    },
    #[command(about = "Print the latest stored QA report")]
    Latest,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  foreman init\n\
  foreman run\n\
  foreman --profile ci --max-cycles 5 run\n\
  foreman status set --agent auth in-progress \"wiring login form\"\n\
  foreman status show\n\
  foreman send --from auth --to supervisor WORKER_COMPLETE\n\
  foreman inbox --agent auth\n\
  foreman qa submit --report qa-report.json\n\
  foreman markers\n\
  foreman telemetry report --limit 2000\n\
\n\
Protocol:\n\
  - Workers report status; the supervisor merges once every feature is COMPLETE.\n\
  - The QA agent receives RUN_QA and answers with QA_RESULT: PASS|FAIL.\n\
  - Failed standards are routed back to their owning worker as FIX_TASK messages.";

#[derive(Debug, Parser)]
#[command(name = "foreman")]
#[command(about = "Supervisor for parallel feature workers and a QA verifier")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "FOREMAN_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "FOREMAN_CONFIG", default_value = ".foreman/config.toml")]
    pub config_path: String,

    #[arg(long, env = "FOREMAN_ROOT")]
    pub root: Option<String>,

    #[arg(long, env = "FOREMAN_REPO_DIR")]
    pub repo_dir: Option<String>,

    #[arg(long, env = "FOREMAN_TRUNK")]
    pub trunk: Option<String>,

    #[arg(long, env = "FOREMAN_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,

    #[arg(long, env = "FOREMAN_MAX_CYCLES")]
    pub max_cycles: Option<u32>,

    #[arg(long, env = "FOREMAN_DELIVERY_MODE", value_enum)]
    pub delivery_mode: Option<DeliveryMode>,

    #[arg(long, env = "FOREMAN_QA_AGENT")]
    pub qa_agent: Option<String>,

    #[arg(long, env = "FOREMAN_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "FOREMAN_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Create feature worktrees and seed PENDING status for every feature")]
    Init,
    #[command(about = "Run the supervisor loop until completion, escalation or halt")]
    Run,
    #[command(about = "Append a message to the shared bus")]
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(required = true)]
        body: Vec<String>,
    },
    #[command(about = "Print unread messages for an agent and advance its cursor")]
    Inbox {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = false)]
        peek: bool,
    },
    #[command(about = "Read or append per-agent lifecycle status")]
    Status {
        #[command(subcommand)]
        command: StatusCommands,
    },
    #[command(about = "QA agent report submission and inspection")]
    Qa {
        #[command(subcommand)]
        command: QaCommands,
    },
    #[command(about = "Show marker signals recomputed from the coordination ledger")]
    Markers,
    #[command(about = "Validate tooling, configuration and workspace layout")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}
