//! Supervisor coordination ledger and the marker projection derived from it.
//!
//! The ledger is the source of truth. Marker files under `markers/` are a
//! cached projection that [`MarkerStore::sync`] rewrites from a
//! [`MarkerView`] after every recorded event; deleting them loses nothing.
use std::collections::BTreeSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::bus::format_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    RunStarted { features: Vec<String>, max_cycles: u32 },
    ScaffoldVerified,
    ScaffoldFailed { log: String },
    CycleStarted { cycle: u32 },
    FeatureMerged { cycle: u32, feature: String },
    AllMerged { cycle: u32 },
    MergeConflict { cycle: u32, feature: String, details: String },
    BuildVerified { cycle: u32 },
    BuildFailed { cycle: u32, log: String },
    QaSignalled { cycle: u32 },
    QaResult { cycle: u32, pass: bool, failed: usize },
    FixAssigned { cycle: u32, target: String, standard_id: String },
    MergeCleared { cycle: u32 },
    WorkerBlocked { agent: String, note: String, since: DateTime<Utc> },
    WorkerFailed { agent: String, note: String, since: DateTime<Utc> },
    ProjectComplete,
    PullRequest { outcome: String },
    ExitSent { agent: String },
    Escalated { cycle: u32, reason: String },
    Halted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LedgerEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Marker {
    BuildVerified,
    AllMerged,
    QaComplete,
    QaNeedsFixes,
    ProjectComplete,
}

impl Marker {
    pub const ALL: [Marker; 5] = [
        Marker::BuildVerified,
        Marker::AllMerged,
        Marker::QaComplete,
        Marker::QaNeedsFixes,
        Marker::ProjectComplete,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Marker::BuildVerified => "build-verified",
            Marker::AllMerged => "all-merged",
            Marker::QaComplete => "qa-complete",
            Marker::QaNeedsFixes => "qa-needs-fixes",
            Marker::ProjectComplete => "project-complete",
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Current-state view recomputed by replaying the ledger of the latest run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerView {
    pub markers: BTreeSet<Marker>,
    pub set_at: Vec<(Marker, DateTime<Utc>)>,
    pub cycle: u32,
    pub qa_in_flight: bool,
    pub exits_sent: BTreeSet<String>,
    pub escalated: bool,
    pub halted: bool,
}

impl MarkerView {
    pub fn replay<'a>(records: impl IntoIterator<Item = &'a LedgerRecord>) -> Self {
        let mut view = Self::default();
        for record in records {
            view.apply(record);
        }
        view
    }

    pub fn is_set(&self, marker: Marker) -> bool {
        self.markers.contains(&marker)
    }

    fn set(&mut self, marker: Marker, ts: DateTime<Utc>) {
        if self.markers.insert(marker) {
            self.set_at.retain(|(m, _)| *m != marker);
            self.set_at.push((marker, ts));
        }
    }

    fn clear(&mut self, marker: Marker) {
        self.markers.remove(&marker);
        self.set_at.retain(|(m, _)| *m != marker);
    }

    pub fn set_time(&self, marker: Marker) -> Option<DateTime<Utc>> {
        self.set_at
            .iter()
            .find(|(m, _)| *m == marker)
            .map(|(_, ts)| *ts)
    }

    pub fn apply(&mut self, record: &LedgerRecord) {
        let ts = record.ts;
        match &record.event {
            LedgerEvent::RunStarted { .. } => *self = Self::default(),
            LedgerEvent::CycleStarted { cycle } => {
                self.cycle = *cycle;
                for marker in [
                    Marker::BuildVerified,
                    Marker::AllMerged,
                    Marker::QaComplete,
                    Marker::QaNeedsFixes,
                ] {
                    self.clear(marker);
                }
            }
            LedgerEvent::AllMerged { .. } => self.set(Marker::AllMerged, ts),
            LedgerEvent::MergeConflict { .. } => self.clear(Marker::AllMerged),
            LedgerEvent::BuildVerified { .. } => self.set(Marker::BuildVerified, ts),
            LedgerEvent::BuildFailed { .. } => self.clear(Marker::BuildVerified),
            LedgerEvent::QaSignalled { .. } => self.qa_in_flight = true,
            LedgerEvent::QaResult { pass, .. } => {
                self.qa_in_flight = false;
                if *pass {
                    self.set(Marker::QaComplete, ts);
                    self.clear(Marker::QaNeedsFixes);
                } else {
                    self.set(Marker::QaNeedsFixes, ts);
                    self.clear(Marker::QaComplete);
                }
            }
            LedgerEvent::MergeCleared { .. } => {
                self.clear(Marker::AllMerged);
                self.clear(Marker::BuildVerified);
            }
            LedgerEvent::ProjectComplete => self.set(Marker::ProjectComplete, ts),
            LedgerEvent::ExitSent { agent } => {
                self.exits_sent.insert(agent.clone());
            }
            LedgerEvent::Escalated { .. } => self.escalated = true,
            LedgerEvent::Halted { .. } => self.halted = true,
            LedgerEvent::ScaffoldVerified
            | LedgerEvent::ScaffoldFailed { .. }
            | LedgerEvent::FeatureMerged { .. }
            | LedgerEvent::FixAssigned { .. }
            | LedgerEvent::WorkerBlocked { .. }
            | LedgerEvent::WorkerFailed { .. }
            | LedgerEvent::PullRequest { .. } => {}
        }
    }

    pub fn format_display(&self) -> String {
        let mut out = String::from("Markers:\n");
        for marker in Marker::ALL {
            match self.set_time(marker) {
                Some(ts) => out.push_str(&format!(
                    "  [✓] {} ({})\n",
                    marker,
                    format_timestamp(&ts)
                )),
                None => out.push_str(&format!("  [ ] {marker}\n")),
            }
        }
        out.push_str(&format!("Cycle: {}\n", self.cycle));
        out.push_str(&format!("QA in flight: {}\n", self.qa_in_flight));
        if self.escalated {
            out.push_str("State: needs human attention\n");
        } else if self.halted {
            out.push_str("State: halted\n");
        }
        out
    }
}

/// Writes marker files as a projection of a [`MarkerView`].
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("markers");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create markers directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, marker: Marker) -> PathBuf {
        self.dir.join(marker.file_name())
    }

    pub fn is_present(&self, marker: Marker) -> bool {
        self.path_for(marker).exists()
    }

    pub fn sync(&self, view: &MarkerView) -> Result<()> {
        for marker in Marker::ALL {
            let path = self.path_for(marker);
            match view.set_time(marker) {
                Some(ts) => {
                    if !path.exists() {
                        std::fs::write(&path, format!("{}\n", format_timestamp(&ts)))
                            .with_context(|| {
                                format!("failed to write marker '{}'", path.display())
                            })?;
                    }
                }
                None => {
                    if path.exists() {
                        std::fs::remove_file(&path).with_context(|| {
                            format!("failed to remove marker '{}'", path.display())
                        })?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Append-only JSONL ledger with its live projection.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    markers: MarkerStore,
    view: MarkerView,
    file_lock: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join("ledger.jsonl");
        let markers = MarkerStore::open(root)?;
        let records = read_ledger(&path)?;
        let view = MarkerView::replay(&records);
        Ok(Self {
            path,
            markers,
            view,
            file_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn view(&self) -> &MarkerView {
        &self.view
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, event: LedgerEvent) -> Result<&MarkerView> {
        let record = LedgerRecord {
            ts: Utc::now(),
            event,
        };
        self.append(&record)?;
        self.view.apply(&record);
        self.markers.sync(&self.view)?;
        Ok(&self.view)
    }

    fn append(&self, record: &LedgerRecord) -> Result<()> {
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open ledger '{}'", self.path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock ledger '{}'", self.path.display()))?;
        let mut line = serde_json::to_string(record).context("failed to serialize ledger event")?;
        line.push('\n');
        let written = file
            .write_all(line.as_bytes())
            .and_then(|_| file.sync_data());
        let _ = FileExt::unlock(&file);
        written.with_context(|| format!("failed to append ledger '{}'", self.path.display()))
    }
}

/// Every parseable record; unreadable lines are skipped with a warning.
pub fn read_ledger(path: &Path) -> Result<Vec<LedgerRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ledger '{}'", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) => tracing::warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping unreadable ledger line"
            ),
        }
    }
    Ok(records)
}
