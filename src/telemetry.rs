//! JSONL trace of supervisor runs.
//!
//! Only `foreman run` writes here. Every record carries the run id so the
//! report can replay each run's path through the state machine.
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub profile: String,
    pub file_lock: Arc<std::sync::Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        let run_id = format!("run-{}-{}", unix_ms_now(), std::process::id());
        Self {
            enabled: cfg.telemetry_enabled,
            path: PathBuf::from(&cfg.telemetry_path),
            run_id,
            profile: cfg.profile.clone(),
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            run_id: String::new(),
            profile: String::new(),
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    /// Append one supervisor event. Write failures are logged, never raised.
    pub fn emit(&self, event: &str, payload: Value) {
        if !self.enabled {
            return;
        }

        let mut record = serde_json::Map::new();
        record.insert("ts_unix_ms".to_string(), json!(unix_ms_now()));
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(self.run_id));
        record.insert("profile".to_string(), json!(self.profile));

        if let Some(map) = payload.as_object() {
            for (key, value) in map {
                record.insert(key.clone(), value.clone());
            }
        }

        let value = Value::Object(record);
        if let Err(err) = self.append_event_line(&value) {
            tracing::warn!(
                event = event,
                path = %self.path.display(),
                error = %err,
                "telemetry write failed"
            );
        }
    }

    fn append_event_line(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create telemetry directory '{}'",
                    parent.display()
                )
            })?;
        }

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open telemetry path '{}'", self.path.display()))?;

        serde_json::to_writer(&mut file, value)
            .with_context(|| format!("failed to serialize telemetry event for '{}'", self.run_id))?;
        writeln!(file).context("failed to write telemetry newline")
    }
}

/// How a traced run ended, if it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Escalated,
    Halted,
}

impl RunEnd {
    pub fn label(self) -> &'static str {
        match self {
            RunEnd::Completed => "completed",
            RunEnd::Escalated => "escalated",
            RunEnd::Halted => "halted",
        }
    }
}

/// One supervisor run reconstructed from its events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTrace {
    pub cycles: u64,
    pub last_phase: Option<String>,
    pub qa_signals: usize,
    pub fixes: usize,
    pub workers_surfaced: usize,
    pub end: Option<RunEnd>,
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub runs: BTreeMap<String, RunTrace>,
    pub phase_counts: HashMap<String, usize>,
    pub last_event_ts_unix_ms: Option<u128>,
}

impl TelemetrySummary {
    pub fn qa_signalled(&self) -> usize {
        self.runs.values().map(|run| run.qa_signals).sum()
    }

    pub fn fixes_assigned(&self) -> usize {
        self.runs.values().map(|run| run.fixes).sum()
    }

    pub fn runs_ended(&self, end: RunEnd) -> usize {
        self.runs.values().filter(|run| run.end == Some(end)).count()
    }
}

/// Summarize the newest `limit` lines. Unparseable lines are counted, not fatal.
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary::default();
    let skip = lines.len().saturating_sub(limit.max(1));

    for line in lines.into_iter().skip(skip) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(_) => {
                summary.parse_errors += 1;
                continue;
            }
        };
        summary.parsed_events += 1;

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map_or(ts, |existing| existing.max(ts)),
            );
        }

        let run_id = parsed
            .get("run_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or("unattributed");
        let run = summary.runs.entry(run_id.to_string()).or_default();
        if let Some(cycle) = parsed
            .get("cycle")
            .or_else(|| parsed.get("cycles"))
            .and_then(Value::as_u64)
        {
            run.cycles = run.cycles.max(cycle);
        }

        match parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
        {
            "phase.entered" => {
                if let Some(phase) = parsed.get("phase").and_then(Value::as_str) {
                    *summary.phase_counts.entry(phase.to_string()).or_insert(0) += 1;
                    run.last_phase = Some(phase.to_string());
                }
            }
            "qa.signalled" => run.qa_signals += 1,
            "fix.assigned" => run.fixes += 1,
            "worker.surfaced" => run.workers_surfaced += 1,
            "run.completed" => run.end = Some(RunEnd::Completed),
            "run.escalated" => run.end = Some(RunEnd::Escalated),
            "run.halted" => run.end = Some(RunEnd::Halted),
            _ => {}
        }
    }

    summary
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let lines = io::BufReader::new(file)
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);
    let mut phases = summary.phase_counts.iter().collect::<Vec<_>>();
    phases.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));

    println!("Telemetry report");
    println!("Path: {}", path.display());
    println!(
        "Events analyzed: {} (parse_errors={})",
        summary.parsed_events, summary.parse_errors
    );
    println!(
        "Supervisor runs: {} (completed={} escalated={} halted={})",
        summary.runs.len(),
        summary.runs_ended(RunEnd::Completed),
        summary.runs_ended(RunEnd::Escalated),
        summary.runs_ended(RunEnd::Halted)
    );
    println!(
        "QA signals: {} fix tasks assigned: {}",
        summary.qa_signalled(),
        summary.fixes_assigned()
    );

    if !phases.is_empty() {
        println!("Phases entered:");
        for (name, count) in phases {
            println!("- {name}: {count}");
        }
    }

    if !summary.runs.is_empty() {
        println!("Runs:");
        for (run_id, run) in &summary.runs {
            let state = match run.end {
                Some(end) => end.label().to_string(),
                None => format!(
                    "in progress at {}",
                    run.last_phase.as_deref().unwrap_or("start")
                ),
            };
            println!(
                "- {run_id}: {state}, cycles={} qa={} fixes={} surfaced={}",
                run.cycles, run.qa_signals, run.fixes, run.workers_surfaced
            );
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {last_ts}");
    }

    Ok(())
}
