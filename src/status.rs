//! Per-agent append-only lifecycle logs.
//!
//! One file per agent, one line per transition:
//! `<ISO-8601 timestamp> [<STATE>] <free text>`. The current status is the
//! last parseable line.
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::bus::format_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Pending,
    InProgress,
    Blocked,
    Testing,
    Complete,
    Failed,
}

impl AgentState {
    pub fn label(self) -> &'static str {
        match self {
            AgentState::Pending => "PENDING",
            AgentState::InProgress => "IN_PROGRESS",
            AgentState::Blocked => "BLOCKED",
            AgentState::Testing => "TESTING",
            AgentState::Complete => "COMPLETE",
            AgentState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Complete | AgentState::Failed)
    }

    /// Whether a log whose current state is `self` may record `next`.
    ///
    /// Terminal states only re-open into IN_PROGRESS (a fix task arrived).
    /// Nothing ever returns to PENDING. A blocked agent may resolve straight
    /// to any non-pending state.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (_, Pending) => self == Pending,
            (Complete | Failed, InProgress) => true,
            (Complete | Failed, _) => false,
            _ => true,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AgentState {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(AgentState::Pending),
            "IN_PROGRESS" => Ok(AgentState::InProgress),
            "BLOCKED" => Ok(AgentState::Blocked),
            "TESTING" => Ok(AgentState::Testing),
            "COMPLETE" => Ok(AgentState::Complete),
            "FAILED" => Ok(AgentState::Failed),
            other => Err(format!("unknown agent state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    pub state: AgentState,
    pub note: String,
}

impl StatusEntry {
    pub fn to_line(&self) -> String {
        let note = self.note.replace(['\n', '\r'], " ");
        if note.trim().is_empty() {
            format!("{} [{}]", format_timestamp(&self.timestamp), self.state)
        } else {
            format!(
                "{} [{}] {}",
                format_timestamp(&self.timestamp),
                self.state,
                note.trim()
            )
        }
    }
}

pub fn parse_status_line(agent: &str, line: &str) -> Option<StatusEntry> {
    let line = line.trim();
    let (timestamp, rest) = line.split_once(' ')?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .ok()?
        .with_timezone(&Utc);
    let rest = rest.trim_start().strip_prefix('[')?;
    let (state, note) = rest.split_once(']')?;
    Some(StatusEntry {
        agent: agent.to_string(),
        timestamp,
        state: state.parse().ok()?,
        note: note.trim().to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransitionError {
    pub agent: String,
    pub from: AgentState,
    pub to: AgentState,
}

impl fmt::Display for StatusTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status transition {} -> {} is not allowed for agent '{}'",
            self.from, self.to, self.agent
        )
    }
}

impl std::error::Error for StatusTransitionError {}

#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("status");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create status directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{agent}.log"))
    }

    /// Every parseable entry for `agent`, oldest first.
    pub fn history(&self, agent: &str) -> Result<Vec<StatusEntry>> {
        let path = self.path_for(agent);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read status log '{}'", path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| parse_status_line(agent, line))
            .collect())
    }

    pub fn current(&self, agent: &str) -> Result<Option<StatusEntry>> {
        Ok(self.history(agent)?.pop())
    }

    /// Append a transition after checking it against the current state.
    pub fn append(&self, agent: &str, state: AgentState, note: &str) -> Result<StatusEntry> {
        let path = self.path_for(agent);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open status log '{}'", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock status log '{}'", path.display()))?;

        let result = (|| -> Result<StatusEntry> {
            if let Some(current) = self.current(agent)?
                && !current.state.can_transition_to(state)
            {
                return Err(StatusTransitionError {
                    agent: agent.to_string(),
                    from: current.state,
                    to: state,
                }
                .into());
            }
            let entry = StatusEntry {
                agent: agent.to_string(),
                timestamp: Utc::now(),
                state,
                note: note.to_string(),
            };
            writeln!(file, "{}", entry.to_line())
                .with_context(|| format!("failed to append status log '{}'", path.display()))?;
            file.sync_data()
                .with_context(|| format!("failed to sync status log '{}'", path.display()))?;
            Ok(entry)
        })();

        let _ = FileExt::unlock(&file);
        let entry = result?;
        tracing::debug!(agent = agent, state = %entry.state, "status appended");
        Ok(entry)
    }

    /// Latest status of every agent in `agents`, read in one pass.
    pub fn snapshot(&self, agents: &[String]) -> Result<StatusSnapshot> {
        let taken_at = Utc::now();
        let mut entries = Vec::with_capacity(agents.len());
        for agent in agents {
            entries.push((agent.clone(), self.current(agent)?));
        }
        Ok(StatusSnapshot { taken_at, entries })
    }
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<(String, Option<StatusEntry>)>,
}

impl StatusSnapshot {
    pub fn state_of(&self, agent: &str) -> Option<AgentState> {
        self.entries
            .iter()
            .find(|(name, _)| name == agent)
            .and_then(|(_, entry)| entry.as_ref().map(|e| e.state))
    }

    /// True only when every agent has a latest entry that is exactly COMPLETE.
    pub fn all_complete(&self) -> bool {
        !self.entries.is_empty()
            && self
                .entries
                .iter()
                .all(|(_, entry)| matches!(entry, Some(e) if e.state == AgentState::Complete))
    }

    pub fn with_state(&self, state: AgentState) -> Vec<&StatusEntry> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| entry.as_ref())
            .filter(|entry| entry.state == state)
            .collect()
    }

    pub fn incomplete(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !matches!(entry, Some(e) if e.state == AgentState::Complete))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn format_table(&self) -> String {
        let mut out = String::new();
        for (name, entry) in &self.entries {
            match entry {
                Some(entry) => out.push_str(&format!(
                    "{:<20} {:<12} {} {}\n",
                    name,
                    entry.state.label(),
                    format_timestamp(&entry.timestamp),
                    entry.note
                )),
                None => out.push_str(&format!("{:<20} {:<12} <no status>\n", name, "-")),
            }
        }
        out
    }
}
