//! Shell-facing command handlers for workers, QA and operators.
use std::path::Path;

use anyhow::{Context, Result};

use crate::bus::{Mailbox, MessageBus, format_timestamp};
use crate::config::RuntimeConfig;
use crate::ledger::{MarkerView, read_ledger};
use crate::qa::QaHandle;
use crate::report::{ReportStore, StandardsCatalog, parse_report};
use crate::status::{AgentState, StatusStore};
use crate::supervisor::{RunOutcome, Supervisor};
use crate::telemetry::TelemetrySink;
use crate::vcs::{WorktreeSetup, ensure_worktree};
use crate::worker::WorkerHandle;

fn open_bus(cfg: &RuntimeConfig) -> Result<MessageBus> {
    MessageBus::open(&cfg.root, cfg.delivery_mode)
}

fn load_catalog(cfg: &RuntimeConfig) -> Result<Option<StandardsCatalog>> {
    cfg.standards_catalog
        .as_deref()
        .map(StandardsCatalog::load)
        .transpose()
}

pub async fn run_init(cfg: &RuntimeConfig) -> Result<()> {
    if cfg.features.is_empty() {
        return Err(anyhow::anyhow!(
            "no features are registered in profile '{}'; add features to '{}'",
            cfg.profile,
            cfg.config_path
        ));
    }
    let status = StatusStore::open(&cfg.root)?;
    open_bus(cfg)?;

    for feature in &cfg.features {
        let setup = ensure_worktree(&cfg.repo_dir, &cfg.trunk, feature)
            .await
            .with_context(|| format!("failed to set up worktree for feature '{}'", feature.name))?;
        let label = match setup {
            WorktreeSetup::Created => "created",
            WorktreeSetup::Attached => "attached to existing branch",
            WorktreeSetup::AlreadyPresent => "already present",
        };
        if status.current(&feature.name)?.is_none() {
            status.append(&feature.name, AgentState::Pending, "registered")?;
        }
        println!(
            "{}: {} ({} at {})",
            feature.name,
            label,
            feature.branch,
            feature.directory.display()
        );
    }
    if status.current(&cfg.qa_agent)?.is_none() {
        status.append(&cfg.qa_agent, AgentState::Pending, "registered")?;
    }
    println!("Coordination root: {}", cfg.root.display());
    Ok(())
}

pub fn run_send(cfg: &RuntimeConfig, from: &str, to: &str, body: &str) -> Result<()> {
    let bus = open_bus(cfg)?;
    let message = bus.send(from, to, body)?;
    println!("sent #{} {} -> {}", message.offset, message.from, message.to);
    Ok(())
}

pub fn run_inbox(cfg: &RuntimeConfig, agent: &str, peek: bool) -> Result<()> {
    let bus = open_bus(cfg)?;
    let mut mailbox = Mailbox::persistent(bus, agent, &cfg.root.join("cursors"))?;
    let messages = if peek {
        mailbox.peek()?
    } else {
        mailbox.receive()?
    };
    if messages.is_empty() {
        println!("No new messages for '{agent}'.");
        return Ok(());
    }
    for message in messages {
        println!(
            "--- #{} {} from {} to {}",
            message.offset,
            format_timestamp(&message.timestamp),
            message.from,
            message.to
        );
        println!("{}", message.body);
    }
    Ok(())
}

pub fn run_status_set(
    cfg: &RuntimeConfig,
    agent: &str,
    state: AgentState,
    note: &str,
) -> Result<()> {
    let worker = WorkerHandle::open(open_bus(cfg)?, &cfg.root, agent)?;
    let entry = if state == AgentState::Complete && cfg.feature(agent).is_some() {
        worker.complete(note)?
    } else {
        worker.set_status(state, note)?
    };
    println!("{}", entry.to_line());
    Ok(())
}

pub fn run_status_show(cfg: &RuntimeConfig, agent: Option<&str>) -> Result<()> {
    let status = StatusStore::open(&cfg.root)?;
    if let Some(agent) = agent {
        let history = status.history(agent)?;
        if history.is_empty() {
            println!("No status recorded for '{agent}'.");
        }
        for entry in history {
            println!("{}", entry.to_line());
        }
        return Ok(());
    }
    let snapshot = status.snapshot(&cfg.known_agents())?;
    print!("{}", snapshot.format_table());
    Ok(())
}

pub fn run_qa_submit(cfg: &RuntimeConfig, report_path: &Path) -> Result<()> {
    let json = std::fs::read_to_string(report_path)
        .with_context(|| format!("failed to read QA report '{}'", report_path.display()))?;
    let report = parse_report(&json)?;
    let mut qa = QaHandle::open(open_bus(cfg)?, &cfg.root, load_catalog(cfg)?, &cfg.qa_agent)?;
    let (stored, report) = qa.submit(report)?;
    print!("{}", report.format_summary());
    println!("Stored at {}", stored.display());
    Ok(())
}

pub fn run_qa_latest(cfg: &RuntimeConfig) -> Result<()> {
    let reports = ReportStore::open(&cfg.root)?;
    match reports.latest()? {
        Some(report) => print!("{}", report.format_summary()),
        None => println!("No QA report stored under '{}'.", reports.dir().display()),
    }
    Ok(())
}

pub fn run_markers(cfg: &RuntimeConfig) -> Result<()> {
    let records = read_ledger(&cfg.root.join("ledger.jsonl"))?;
    let view = MarkerView::replay(&records);
    print!("{}", view.format_display());
    Ok(())
}

pub async fn run_supervisor(cfg: &RuntimeConfig, telemetry: TelemetrySink) -> Result<RunOutcome> {
    let mut supervisor = Supervisor::from_config(cfg.clone(), telemetry)?;
    let outcome = tokio::select! {
        outcome = supervisor.run() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; progress so far is kept in the ledger");
            RunOutcome::Cancelled {
                by: "interrupt".to_string(),
            }
        }
    };
    println!("{}", outcome.describe());
    Ok(outcome)
}
