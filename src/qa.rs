//! QA side of the protocol: one run per RUN_QA, one report, one QA_RESULT.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::bus::{Intent, Mailbox, Message, MessageBus, QaVerdict, SUPERVISOR_AGENT};
use crate::report::{QaReport, ReportStore, StandardsCatalog};

#[derive(Debug, Default)]
pub struct QaPoll {
    /// The RUN_QA accepted by this poll, if any.
    pub run: Option<Message>,
    /// RUN_QA messages refused because a run was still open.
    pub refused: usize,
    pub exit: bool,
}

pub struct QaHandle {
    agent: String,
    bus: MessageBus,
    mailbox: Mailbox,
    reports: ReportStore,
    catalog: Option<StandardsCatalog>,
    open_run: Option<Message>,
}

impl QaHandle {
    pub fn new(
        bus: MessageBus,
        reports: ReportStore,
        catalog: Option<StandardsCatalog>,
        agent: &str,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            mailbox: Mailbox::new(bus.clone(), agent),
            bus,
            reports,
            catalog,
            open_run: None,
        }
    }

    pub fn open(
        bus: MessageBus,
        root: &Path,
        catalog: Option<StandardsCatalog>,
        agent: &str,
    ) -> Result<Self> {
        Ok(Self {
            agent: agent.to_string(),
            mailbox: Mailbox::persistent(bus.clone(), agent, &root.join("cursors"))?,
            reports: ReportStore::open(root)?,
            bus,
            catalog,
            open_run: None,
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn run_open(&self) -> bool {
        self.open_run.is_some()
    }

    /// Accept at most one RUN_QA; further signals are refused until the open
    /// run has been answered with a report.
    pub fn poll(&mut self) -> Result<QaPoll> {
        let mut poll = QaPoll::default();
        for message in self.mailbox.receive()? {
            match message.intent() {
                Intent::RunQa if self.open_run.is_none() => {
                    tracing::info!(agent = %self.agent, from = %message.from, "QA run accepted");
                    self.open_run = Some(message.clone());
                    poll.run = Some(message);
                }
                Intent::RunQa => {
                    tracing::warn!(
                        agent = %self.agent,
                        "RUN_QA received while a run is still open; ignoring"
                    );
                    poll.refused += 1;
                }
                Intent::Exit => poll.exit = true,
                _ => {}
            }
        }
        Ok(poll)
    }

    /// Validate, store and announce a report. Exactly one QA_RESULT per call.
    pub fn submit(&mut self, report: QaReport) -> Result<(PathBuf, QaReport)> {
        let report = report.normalized();
        if let Some(catalog) = self.catalog.as_ref() {
            catalog.check_coverage(&report)?;
        }
        let path = self.reports.store(&report)?;

        let verdict = if report.overall_pass {
            QaVerdict::Pass
        } else {
            QaVerdict::Fail
        };
        let body = format!(
            "{}\n\n{}",
            Intent::QaResult(verdict).headline(),
            report.format_summary()
        );
        self.bus
            .send(&self.agent, SUPERVISOR_AGENT, &body)
            .context("failed to send QA result")?;
        self.open_run = None;
        tracing::info!(
            agent = %self.agent,
            verdict = verdict.label(),
            report = %path.display(),
            "QA report submitted"
        );
        Ok((path, report))
    }

    pub async fn wait(&self, max: Duration) {
        self.mailbox.wait(max).await;
    }
}
