//! Worker side of the protocol.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::bus::{Intent, Mailbox, Message, MessageBus, SUPERVISOR_AGENT};
use crate::status::{AgentState, StatusEntry, StatusStore};

/// A fix task received by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedFix {
    pub standard_id: String,
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct WorkerInbox {
    pub fixes: Vec<AssignedFix>,
    pub notes: Vec<Message>,
    pub exit: bool,
}

pub struct WorkerHandle {
    agent: String,
    bus: MessageBus,
    mailbox: Mailbox,
    status: StatusStore,
}

impl WorkerHandle {
    pub fn new(bus: MessageBus, status: StatusStore, agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            mailbox: Mailbox::new(bus.clone(), agent),
            bus,
            status,
        }
    }

    /// Worker whose mailbox cursor is kept under `<root>/cursors`.
    pub fn open(bus: MessageBus, root: &Path, agent: &str) -> Result<Self> {
        Ok(Self {
            agent: agent.to_string(),
            mailbox: Mailbox::persistent(bus.clone(), agent, &root.join("cursors"))?,
            status: StatusStore::open(root)?,
            bus,
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn current(&self) -> Result<Option<StatusEntry>> {
        self.status.current(&self.agent)
    }

    pub fn set_status(&self, state: AgentState, note: &str) -> Result<StatusEntry> {
        self.status.append(&self.agent, state, note)
    }

    /// Record COMPLETE and wake the supervisor.
    pub fn complete(&self, note: &str) -> Result<StatusEntry> {
        let entry = self.set_status(AgentState::Complete, note)?;
        self.bus
            .send(
                &self.agent,
                SUPERVISOR_AGENT,
                &format!("{}\n\n{}", Intent::WorkerComplete.headline(), note.trim()),
            )
            .context("failed to notify supervisor of completion")?;
        Ok(entry)
    }

    /// Drain the mailbox. A fix task re-opens the worker into IN_PROGRESS.
    pub fn poll(&mut self) -> Result<WorkerInbox> {
        let mut inbox = WorkerInbox::default();
        for message in self.mailbox.receive()? {
            match message.intent() {
                Intent::FixTask { standard_id } => {
                    self.reopen(&standard_id)?;
                    inbox.fixes.push(AssignedFix {
                        standard_id,
                        message,
                    });
                }
                Intent::Exit => inbox.exit = true,
                _ => inbox.notes.push(message),
            }
        }
        Ok(inbox)
    }

    fn reopen(&self, standard_id: &str) -> Result<()> {
        let current = self.current()?.map(|entry| entry.state);
        if current == Some(AgentState::InProgress) {
            return Ok(());
        }
        self.set_status(
            AgentState::InProgress,
            &format!("re-opened by fix task {standard_id}"),
        )?;
        tracing::info!(agent = %self.agent, standard = standard_id, "fix task received");
        Ok(())
    }

    pub async fn wait(&self, max: Duration) {
        self.mailbox.wait(max).await;
    }
}
