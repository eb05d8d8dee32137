//! The coordinator: scaffold check, worker monitoring, merge, build
//! verification, QA signalling and fix-task routing, bounded by a retry
//! budget.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::bus::{Intent, Mailbox, MessageBus, QaVerdict, SUPERVISOR_AGENT, UNKNOWN_OWNER};
use crate::cli::BuildFailureRouting;
use crate::config::RuntimeConfig;
use crate::error::FailureKind;
use crate::gate::{BuildGate, GateStage, ShellBuildGate};
use crate::ledger::{Ledger, LedgerEvent};
use crate::pr::{GhPublisher, PrOutcome, PrPublisher, PrRequest};
use crate::report::{
    BUILD_BROKEN_STANDARD, FixTask, QaReport, ReportStore, StandardResult, StandardsCatalog,
    default_required_actions,
};
use crate::status::{AgentState, StatusStore};
use crate::telemetry::TelemetrySink;
use crate::vcs::{GitMerger, MergeOutcome, Merger};

/// Synthetic standard used when QA answers without a readable report.
pub const MISSING_REPORT_STANDARD: &str = "QA-REPORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ScaffoldCheck,
    MonitorWorkers,
    Merge,
    BuildVerify,
    SignalQa,
    WaitQa,
    AssignFixes,
    Done,
    Escalated,
    Halted,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::ScaffoldCheck => "SCAFFOLD_CHECK",
            Phase::MonitorWorkers => "MONITOR_WORKERS",
            Phase::Merge => "MERGE",
            Phase::BuildVerify => "BUILD_VERIFY",
            Phase::SignalQa => "SIGNAL_QA",
            Phase::WaitQa => "WAIT_QA",
            Phase::AssignFixes => "ASSIGN_FIXES",
            Phase::Done => "DONE",
            Phase::Escalated => "ESCALATED",
            Phase::Halted => "HALTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Complete {
        cycles: u32,
        pull_request: PrOutcome,
    },
    /// The retry budget ran out; a human has to look at the failures.
    Escalated { cycles: u32, reason: String },
    Halted { failure: FailureKind, reason: String },
    /// An agent asked the supervisor to stop.
    Cancelled { by: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Complete { .. } => 0,
            RunOutcome::Escalated { .. } => 2,
            RunOutcome::Halted { .. } | RunOutcome::Cancelled { .. } => 1,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RunOutcome::Complete {
                cycles,
                pull_request,
            } => format!("project complete after {cycles} cycle(s); pull request {pull_request}"),
            RunOutcome::Escalated { cycles, reason } => {
                format!("needs human attention after {cycles} cycle(s): {reason}")
            }
            RunOutcome::Halted { failure, reason } => {
                format!("halted [{}] {}\nHint: {}", failure.code(), reason, failure.hint())
            }
            RunOutcome::Cancelled { by } => format!("cancelled by '{by}'"),
        }
    }
}

enum Wake {
    Ready,
    Exit { from: String },
}

enum QaAnswer {
    Report(QaReport),
    Exit { from: String },
}

/// Owner of a failed standard: the reported feature when it is registered,
/// then the ownership table, then the triage sentinel.
pub fn route_standard(cfg: &RuntimeConfig, result: &StandardResult) -> String {
    if let Some(feature) = result.affected_feature.as_deref()
        && cfg.feature(feature).is_some()
    {
        return feature.to_string();
    }
    cfg.ownership
        .get(&result.id)
        .filter(|owner| cfg.feature(owner).is_some())
        .cloned()
        .unwrap_or_else(|| UNKNOWN_OWNER.to_string())
}

/// One fix task per failed standard and owner.
pub fn build_fix_tasks(
    report: &QaReport,
    cfg: &RuntimeConfig,
    catalog: Option<&StandardsCatalog>,
    cycle: u32,
) -> Vec<FixTask> {
    let created_at = Utc::now();
    let mut seen = BTreeSet::new();
    let mut tasks = Vec::new();
    for result in report.failures() {
        let target = route_standard(cfg, result);
        if !seen.insert((target.clone(), result.id.clone())) {
            continue;
        }
        let description = catalog
            .and_then(|catalog| catalog.get(&result.id))
            .map(|standard| standard.description.clone())
            .or_else(|| (!result.name.trim().is_empty()).then(|| result.name.clone()))
            .unwrap_or_else(|| result.id.clone());
        tasks.push(FixTask {
            target,
            standard_id: result.id.clone(),
            description,
            error: result.explanation().to_string(),
            required_actions: default_required_actions(&result.id),
            created_at,
            cycle,
        });
    }
    tasks
}

/// Fix tasks for a merged trunk that does not build.
pub fn build_failure_tasks(
    cfg: &RuntimeConfig,
    last_merged: Option<&str>,
    log: &str,
    cycle: u32,
) -> Vec<FixTask> {
    let targets = match (cfg.build_failure_routing, last_merged) {
        (BuildFailureRouting::LastMerged, Some(feature)) => vec![feature.to_string()],
        _ => cfg.feature_names(),
    };
    let created_at = Utc::now();
    targets
        .into_iter()
        .map(|target| FixTask {
            target,
            standard_id: BUILD_BROKEN_STANDARD.to_string(),
            description: "Merged trunk fails build verification".to_string(),
            error: log.to_string(),
            required_actions: default_required_actions(BUILD_BROKEN_STANDARD),
            created_at,
            cycle,
        })
        .collect()
}

fn missing_report(reason: &str) -> QaReport {
    QaReport::new(vec![StandardResult {
        id: MISSING_REPORT_STANDARD.to_string(),
        name: "QA report available".to_string(),
        pass: false,
        details: None,
        error: Some(reason.to_string()),
        affected_feature: None,
    }])
}

pub struct Supervisor {
    cfg: RuntimeConfig,
    bus: MessageBus,
    mailbox: Mailbox,
    status: StatusStore,
    reports: ReportStore,
    ledger: Ledger,
    catalog: Option<StandardsCatalog>,
    gate: Arc<dyn BuildGate>,
    merger: Arc<dyn Merger>,
    publisher: Arc<dyn PrPublisher>,
    telemetry: TelemetrySink,
    phase: Phase,
    surfaced: HashSet<(String, DateTime<Utc>)>,
    /// Status history length per feature when a fix was routed to it; the
    /// feature only counts as done again once a newer COMPLETE appears.
    awaiting_fix: BTreeMap<String, usize>,
    last_merged: Option<String>,
    qa_signalled_at: Option<DateTime<Utc>>,
    /// Bus offset of the latest RUN_QA; only answers appended after it count.
    qa_signal_offset: Option<u64>,
}

impl Supervisor {
    pub fn new(
        cfg: RuntimeConfig,
        bus: MessageBus,
        gate: Arc<dyn BuildGate>,
        merger: Arc<dyn Merger>,
        publisher: Arc<dyn PrPublisher>,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        let mailbox =
            Mailbox::persistent(bus.clone(), SUPERVISOR_AGENT, &cfg.root.join("cursors"))?;
        let status = StatusStore::open(&cfg.root)?;
        let reports = ReportStore::open(&cfg.root)?;
        let ledger = Ledger::open(&cfg.root)?;
        let catalog = match cfg.standards_catalog.as_deref() {
            Some(path) => Some(StandardsCatalog::load(path)?),
            None => None,
        };
        Ok(Self {
            cfg,
            bus,
            mailbox,
            status,
            reports,
            ledger,
            catalog,
            gate,
            merger,
            publisher,
            telemetry,
            phase: Phase::ScaffoldCheck,
            surfaced: HashSet::new(),
            awaiting_fix: BTreeMap::new(),
            last_merged: None,
            qa_signalled_at: None,
            qa_signal_offset: None,
        })
    }

    /// Supervisor wired to git, the shell build gate and the GitHub CLI.
    pub fn from_config(cfg: RuntimeConfig, telemetry: TelemetrySink) -> Result<Self> {
        let bus = MessageBus::open(&cfg.root, cfg.delivery_mode)?;
        let gate = Arc::new(ShellBuildGate::new(
            cfg.repo_dir.clone(),
            cfg.build.clone(),
            cfg.root.join("logs"),
        ));
        let merger = Arc::new(GitMerger::new(cfg.repo_dir.clone(), cfg.trunk.clone()));
        let publisher = Arc::new(GhPublisher::new(
            cfg.repo_dir.clone(),
            cfg.pull_request.clone(),
        ));
        Self::new(cfg, bus, gate, merger, publisher, telemetry)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn enter(&mut self, phase: Phase, cycle: u32) {
        self.phase = phase;
        tracing::info!(phase = phase.label(), cycle, "supervisor phase");
        self.telemetry.emit(
            "phase.entered",
            json!({ "phase": phase.label(), "cycle": cycle }),
        );
    }

    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.ledger.record(LedgerEvent::RunStarted {
            features: self.cfg.feature_names(),
            max_cycles: self.cfg.max_cycles,
        })?;
        // Messages from earlier runs carry no meaning for this one.
        self.mailbox.skip_to_end()?;

        self.enter(Phase::ScaffoldCheck, 0);
        let scaffold = self.gate.verify(GateStage::Scaffold).await;
        if !scaffold.ok {
            self.ledger.record(LedgerEvent::ScaffoldFailed {
                log: scaffold.log.clone(),
            })?;
            return self.halt(
                FailureKind::ScaffoldFailure,
                format!("trunk fails build verification before work starts:\n{}", scaffold.log),
            );
        }
        self.ledger.record(LedgerEvent::ScaffoldVerified)?;

        let mut cycle = 0u32;
        loop {
            self.enter(Phase::MonitorWorkers, cycle);
            if let Wake::Exit { from } = self.monitor_workers().await? {
                return self.cancel(from);
            }

            cycle += 1;
            self.ledger.record(LedgerEvent::CycleStarted { cycle })?;

            self.enter(Phase::Merge, cycle);
            if let Some(outcome) = self.merge_all(cycle).await? {
                return Ok(outcome);
            }

            self.enter(Phase::BuildVerify, cycle);
            let build = self.gate.verify(GateStage::PostMerge).await;
            if !build.ok {
                self.ledger.record(LedgerEvent::BuildFailed {
                    cycle,
                    log: build.log.clone(),
                })?;
                tracing::warn!(
                    cycle,
                    failure = FailureKind::BuildVerificationFailure.code(),
                    "merged trunk failed build verification"
                );
                let tasks =
                    build_failure_tasks(&self.cfg, self.last_merged.as_deref(), &build.log, cycle);
                let outcome = self.route_failures(cycle, tasks, "build verification failed")?;
                if let Some(outcome) = outcome {
                    return Ok(outcome);
                }
                continue;
            }
            self.ledger.record(LedgerEvent::BuildVerified { cycle })?;

            self.enter(Phase::SignalQa, cycle);
            self.signal_qa(cycle)?;

            self.enter(Phase::WaitQa, cycle);
            let report = match self.wait_for_qa().await? {
                QaAnswer::Report(report) => report,
                QaAnswer::Exit { from } => return self.cancel(from),
            };
            self.ledger.record(LedgerEvent::QaResult {
                cycle,
                pass: report.overall_pass,
                failed: report.summary.failed,
            })?;
            tracing::info!(
                cycle,
                pass = report.overall_pass,
                passed = report.summary.passed,
                failed = report.summary.failed,
                "QA result received"
            );

            if report.overall_pass {
                return self.finish(cycle, &report).await;
            }

            let tasks = build_fix_tasks(&report, &self.cfg, self.catalog.as_ref(), cycle);
            let failed = tasks
                .iter()
                .map(|task| task.standard_id.as_str())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
                .join(", ");
            let reason = format!("QA failed standards: {failed}");
            if let Some(outcome) = self.route_failures(cycle, tasks, &reason)? {
                return Ok(outcome);
            }
        }
    }

    /// Block until every feature reports COMPLETE in one snapshot.
    async fn monitor_workers(&mut self) -> Result<Wake> {
        let features = self.cfg.feature_names();
        loop {
            let snapshot = self.status.snapshot(&features)?;
            self.surface_problems(&snapshot.with_state(AgentState::Blocked))?;
            self.surface_problems(&snapshot.with_state(AgentState::Failed))?;

            let mut waiting = snapshot.incomplete();
            for (feature, seen) in &self.awaiting_fix {
                if !waiting.contains(feature) && self.status.history(feature)?.len() <= *seen {
                    waiting.push(feature.clone());
                }
            }
            if waiting.is_empty() {
                self.awaiting_fix.clear();
                return Ok(Wake::Ready);
            }
            tracing::debug!(waiting = ?waiting, "waiting for workers");

            for message in self.mailbox.receive()? {
                match message.intent() {
                    Intent::Exit => return Ok(Wake::Exit { from: message.from }),
                    Intent::WorkerComplete => {
                        tracing::debug!(from = %message.from, "worker reported completion")
                    }
                    other => tracing::debug!(
                        from = %message.from,
                        intent = ?other,
                        "ignoring message while monitoring workers"
                    ),
                }
            }
            self.mailbox.wait(self.cfg.poll_interval).await;
        }
    }

    fn surface_problems(&mut self, entries: &[&crate::status::StatusEntry]) -> Result<()> {
        for entry in entries {
            if !self.surfaced.insert((entry.agent.clone(), entry.timestamp)) {
                continue;
            }
            tracing::warn!(
                agent = %entry.agent,
                state = %entry.state,
                note = %entry.note,
                failure = FailureKind::WorkerBlocked.code(),
                "worker needs attention"
            );
            let event = match entry.state {
                AgentState::Failed => LedgerEvent::WorkerFailed {
                    agent: entry.agent.clone(),
                    note: entry.note.clone(),
                    since: entry.timestamp,
                },
                _ => LedgerEvent::WorkerBlocked {
                    agent: entry.agent.clone(),
                    note: entry.note.clone(),
                    since: entry.timestamp,
                },
            };
            self.ledger.record(event)?;
            self.telemetry.emit(
                "worker.surfaced",
                json!({ "agent": entry.agent, "state": entry.state.label() }),
            );
        }
        Ok(())
    }

    /// Merge every feature in registration order; a conflict halts the run.
    async fn merge_all(&mut self, cycle: u32) -> Result<Option<RunOutcome>> {
        let features = self.cfg.features.clone();
        for feature in &features {
            match self.merger.merge(feature).await {
                Ok(MergeOutcome::Merged) => {
                    self.last_merged = Some(feature.name.clone());
                    self.ledger.record(LedgerEvent::FeatureMerged {
                        cycle,
                        feature: feature.name.clone(),
                    })?;
                }
                Ok(MergeOutcome::Conflict { details }) => {
                    self.ledger.record(LedgerEvent::MergeConflict {
                        cycle,
                        feature: feature.name.clone(),
                        details: details.clone(),
                    })?;
                    return self
                        .halt(
                            FailureKind::MergeConflict,
                            format!("merging '{}' conflicts with trunk ({details})", feature.name),
                        )
                        .map(Some);
                }
                Err(err) => {
                    self.ledger.record(LedgerEvent::MergeConflict {
                        cycle,
                        feature: feature.name.clone(),
                        details: err.to_string(),
                    })?;
                    return self
                        .halt(
                            FailureKind::MergeConflict,
                            format!("merging '{}' failed: {err}", feature.name),
                        )
                        .map(Some);
                }
            }
        }
        self.ledger.record(LedgerEvent::AllMerged { cycle })?;
        Ok(None)
    }

    /// Send the single RUN_QA for this cycle. Refuses while a run is in flight.
    pub fn signal_qa(&mut self, cycle: u32) -> Result<()> {
        if self.ledger.view().qa_in_flight {
            return Err(anyhow::anyhow!(
                "a QA run is already in flight; refusing to send another RUN_QA"
            ));
        }
        let signalled_at = Utc::now();
        let body = format!(
            "{}\n\nCycle {cycle}: all features merged into '{}' and the build is verified.",
            Intent::RunQa.headline(),
            self.cfg.trunk
        );
        let signal = self
            .bus
            .send(SUPERVISOR_AGENT, &self.cfg.qa_agent, &body)
            .context("failed to signal QA")?;
        self.ledger.record(LedgerEvent::QaSignalled { cycle })?;
        self.qa_signalled_at = Some(signalled_at);
        self.qa_signal_offset = Some(signal.offset);
        self.telemetry
            .emit("qa.signalled", json!({ "cycle": cycle, "agent": self.cfg.qa_agent }));
        Ok(())
    }

    fn fresh_report(&self) -> Result<Option<QaReport>> {
        let Some(report) = self.reports.latest()? else {
            return Ok(None);
        };
        let fresh = self
            .qa_signalled_at
            .is_none_or(|signalled| report.timestamp >= signalled);
        Ok(fresh.then_some(report))
    }

    /// Wait for QA_RESULT or a report newer than the signal. No deadline.
    async fn wait_for_qa(&mut self) -> Result<QaAnswer> {
        loop {
            let mut verdict = None;
            for message in self.mailbox.receive()? {
                match message.intent() {
                    Intent::QaResult(result)
                        if message.from == self.cfg.qa_agent
                            && self
                                .qa_signal_offset
                                .is_none_or(|offset| message.offset > offset) =>
                    {
                        verdict = Some(result)
                    }
                    Intent::Exit => return Ok(QaAnswer::Exit { from: message.from }),
                    other => tracing::debug!(
                        from = %message.from,
                        intent = ?other,
                        "ignoring message while waiting for QA"
                    ),
                }
            }

            let report = match self.fresh_report() {
                Ok(report) => report,
                Err(err) if verdict.is_some() => {
                    tracing::warn!(error = %format!("{err:#}"), "QA result has no readable report");
                    return Ok(QaAnswer::Report(missing_report(&format!(
                        "QA reported a result but its report could not be read: {err:#}"
                    ))));
                }
                Err(err) => {
                    tracing::debug!(error = %format!("{err:#}"), "latest report not readable yet");
                    None
                }
            };

            match (report, verdict) {
                (Some(report), verdict) => {
                    if let Some(verdict) = verdict {
                        let agrees = matches!(
                            (verdict, report.overall_pass),
                            (QaVerdict::Pass, true) | (QaVerdict::Fail, false)
                        );
                        if !agrees {
                            tracing::warn!(
                                verdict = verdict.label(),
                                report_pass = report.overall_pass,
                                "QA message disagrees with its report; the report wins"
                            );
                        }
                    }
                    if let Some(catalog) = self.catalog.as_ref()
                        && let Err(err) = catalog.check_coverage(&report)
                    {
                        tracing::warn!(error = %err, "QA report does not cover the catalog");
                    }
                    return Ok(QaAnswer::Report(report));
                }
                (None, Some(verdict)) => {
                    tracing::warn!(
                        verdict = verdict.label(),
                        "QA result arrived without a new report"
                    );
                    return Ok(QaAnswer::Report(missing_report(
                        "QA reported a result but no report newer than the signal exists",
                    )));
                }
                (None, None) => self.mailbox.wait(self.cfg.poll_interval).await,
            }
        }
    }

    /// Assign fix tasks for a failing cycle, or escalate once the retry
    /// budget is spent.
    fn route_failures(
        &mut self,
        cycle: u32,
        tasks: Vec<FixTask>,
        reason: &str,
    ) -> Result<Option<RunOutcome>> {
        if cycle >= self.cfg.max_cycles {
            for task in &tasks {
                task.save(&self.cfg.root)?;
            }
            let reason = format!(
                "{reason} (retry budget of {} cycle(s) spent)",
                self.cfg.max_cycles
            );
            return self.escalate(cycle, reason).map(Some);
        }

        self.enter(Phase::AssignFixes, cycle);
        self.assign_fixes(cycle, &tasks)?;
        Ok(None)
    }

    fn assign_fixes(&mut self, cycle: u32, tasks: &[FixTask]) -> Result<()> {
        for task in tasks {
            // Measured before sending so a fast worker cannot slip past the gate.
            if self.cfg.feature(&task.target).is_some()
                && !self.awaiting_fix.contains_key(&task.target)
            {
                let seen = self.status.history(&task.target)?.len();
                self.awaiting_fix.insert(task.target.clone(), seen);
            }
            let path = task.save(&self.cfg.root)?;
            if self.cfg.feature(&task.target).is_none() {
                tracing::warn!(
                    cycle,
                    standard = %task.standard_id,
                    document = %path.display(),
                    "failed standard has no owning feature; routed to triage"
                );
            }
            self.bus
                .send(SUPERVISOR_AGENT, &task.target, &task.message_body())
                .with_context(|| format!("failed to send fix task to '{}'", task.target))?;
            self.ledger.record(LedgerEvent::FixAssigned {
                cycle,
                target: task.target.clone(),
                standard_id: task.standard_id.clone(),
            })?;
            tracing::info!(
                cycle,
                target = %task.target,
                standard = %task.standard_id,
                document = %path.display(),
                "fix task assigned"
            );
            self.telemetry.emit(
                "fix.assigned",
                json!({ "cycle": cycle, "target": task.target, "standard": task.standard_id }),
            );
        }
        self.ledger.record(LedgerEvent::MergeCleared { cycle })?;
        Ok(())
    }

    async fn finish(&mut self, cycle: u32, report: &QaReport) -> Result<RunOutcome> {
        self.enter(Phase::Done, cycle);

        let request = PrRequest {
            title: format!("Merge features: {}", self.cfg.feature_names().join(", ")),
            body: format!(
                "All registered features were merged into `{}` and verified.\n\n\
                 Cycles: {cycle}\n\n```\n{}```\n",
                self.cfg.trunk,
                report.format_summary()
            ),
            head: self.cfg.trunk.clone(),
        };
        let pull_request = self.publisher.publish(&request).await;
        match &pull_request {
            PrOutcome::Created { url } => tracing::info!(url = %url, "pull request created"),
            PrOutcome::Skipped { reason } => {
                tracing::info!(reason = %reason, "pull request skipped")
            }
            PrOutcome::Failed { error } => tracing::warn!(
                error = %error,
                failure = FailureKind::PrCreationFailure.code(),
                "pull request creation failed"
            ),
        }
        self.ledger.record(LedgerEvent::PullRequest {
            outcome: pull_request.to_string(),
        })?;

        self.ledger.record(LedgerEvent::ProjectComplete)?;

        for agent in self.cfg.known_agents() {
            if self.ledger.view().exits_sent.contains(&agent) {
                continue;
            }
            self.bus
                .send(SUPERVISOR_AGENT, &agent, &Intent::Exit.headline())
                .with_context(|| format!("failed to send /exit to '{agent}'"))?;
            self.ledger.record(LedgerEvent::ExitSent { agent })?;
        }

        self.telemetry.emit(
            "run.completed",
            json!({ "cycles": cycle, "pull_request": pull_request.to_string() }),
        );
        Ok(RunOutcome::Complete {
            cycles: cycle,
            pull_request,
        })
    }

    fn escalate(&mut self, cycle: u32, reason: String) -> Result<RunOutcome> {
        self.enter(Phase::Escalated, cycle);
        tracing::error!(cycle, reason = %reason, "run needs human attention");
        self.ledger.record(LedgerEvent::Escalated {
            cycle,
            reason: reason.clone(),
        })?;
        self.telemetry
            .emit("run.escalated", json!({ "cycles": cycle, "reason": reason }));
        Ok(RunOutcome::Escalated {
            cycles: cycle,
            reason,
        })
    }

    fn halt(&mut self, failure: FailureKind, reason: String) -> Result<RunOutcome> {
        let cycle = self.ledger.view().cycle;
        self.enter(Phase::Halted, cycle);
        tracing::error!(failure = failure.code(), reason = %reason, "run halted");
        self.ledger.record(LedgerEvent::Halted {
            reason: format!("{}: {reason}", failure.code()),
        })?;
        self.telemetry.emit(
            "run.halted",
            json!({ "failure": failure.code(), "reason": reason }),
        );
        Ok(RunOutcome::Halted { failure, reason })
    }

    fn cancel(&mut self, by: String) -> Result<RunOutcome> {
        let cycle = self.ledger.view().cycle;
        self.enter(Phase::Halted, cycle);
        tracing::info!(by = %by, "received /exit; stopping");
        self.ledger.record(LedgerEvent::Halted {
            reason: format!("/exit from {by}"),
        })?;
        self.telemetry.emit("run.halted", json!({ "cancelled_by": by }));
        Ok(RunOutcome::Cancelled { by })
    }
}
