//! QA reports, the standards catalog and fix-task documents.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::format_timestamp;

// ---------------------------------------------------------------------------
// QA report schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardResult {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_feature: Option<String>,
}

impl StandardResult {
    /// The most useful text explaining this result.
    pub fn explanation(&self) -> &str {
        self.error
            .as_deref()
            .or(self.details.as_deref())
            .unwrap_or("no details reported")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl ReportSummary {
    pub fn from_results(results: &[StandardResult]) -> Self {
        let passed = results.iter().filter(|r| r.pass).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaReport {
    pub timestamp: DateTime<Utc>,
    pub overall_pass: bool,
    pub results: Vec<StandardResult>,
    #[serde(default)]
    pub summary: ReportSummary,
}

impl QaReport {
    pub fn new(results: Vec<StandardResult>) -> Self {
        let summary = ReportSummary::from_results(&results);
        Self {
            timestamp: Utc::now(),
            overall_pass: summary.failed == 0,
            results,
            summary,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StandardResult> {
        self.results.iter().filter(|r| !r.pass)
    }

    /// Recompute summary counts from the parsed results and reconcile the
    /// verdict: a report with any failing result never counts as a pass.
    pub fn normalized(mut self) -> Self {
        let computed = ReportSummary::from_results(&self.results);
        if computed != self.summary {
            tracing::warn!(
                reported_total = self.summary.total,
                reported_failed = self.summary.failed,
                total = computed.total,
                failed = computed.failed,
                "QA report summary disagrees with its results; using recomputed counts"
            );
        }
        self.summary = computed;
        if self.overall_pass && computed.failed > 0 {
            tracing::warn!(
                failed = computed.failed,
                "QA report claims overall pass with failing standards; treating as failure"
            );
            self.overall_pass = false;
        }
        self
    }

    pub fn format_summary(&self) -> String {
        let status = if self.overall_pass {
            "✓ PASSED"
        } else {
            "✗ FAILED"
        };
        let mut out = format!(
            "QA report {} ({}): {}/{} passed, {} failed\n",
            format_timestamp(&self.timestamp),
            status,
            self.summary.passed,
            self.summary.total,
            self.summary.failed
        );
        for result in &self.results {
            let mark = if result.pass { "✓" } else { "✗" };
            out.push_str(&format!("  [{mark}] {} {}", result.id, result.name));
            if let Some(feature) = result.affected_feature.as_deref() {
                out.push_str(&format!(" (feature: {feature})"));
            }
            out.push('\n');
            if !result.pass {
                out.push_str(&format!("      {}\n", result.explanation()));
            }
        }
        out
    }
}

pub fn parse_report(json: &str) -> Result<QaReport> {
    let report = serde_json::from_str::<QaReport>(json).context("invalid QA report document")?;
    Ok(report.normalized())
}

// ---------------------------------------------------------------------------
// Standards catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standard {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardsCatalog {
    #[serde(default)]
    pub standards: Vec<Standard>,
}

impl StandardsCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read standards catalog '{}'", path.display()))?;
        let catalog = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str::<StandardsCatalog>(&content)
                .with_context(|| format!("invalid standards catalog '{}'", path.display()))?
        } else {
            toml::from_str::<StandardsCatalog>(&content)
                .with_context(|| format!("invalid standards catalog '{}'", path.display()))?
        };

        let mut seen = BTreeSet::new();
        for standard in &catalog.standards {
            if !seen.insert(standard.id.as_str()) {
                return Err(anyhow::anyhow!(
                    "standards catalog '{}' lists '{}' twice",
                    path.display(),
                    standard.id
                ));
            }
        }
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&Standard> {
        self.standards.iter().find(|s| s.id == id)
    }

    /// A report must cover the catalog exactly: every id once, nothing extra.
    pub fn check_coverage(&self, report: &QaReport) -> Result<()> {
        let expected = self
            .standards
            .iter()
            .map(|s| s.id.as_str())
            .collect::<BTreeSet<_>>();
        let mut seen = BTreeSet::new();
        for result in &report.results {
            if !seen.insert(result.id.as_str()) {
                return Err(anyhow::anyhow!(
                    "QA report lists standard '{}' more than once",
                    result.id
                ));
            }
        }
        let missing = expected.difference(&seen).copied().collect::<Vec<_>>();
        let unknown = seen.difference(&expected).copied().collect::<Vec<_>>();
        if !missing.is_empty() || !unknown.is_empty() {
            return Err(anyhow::anyhow!(
                "QA report does not match the standards catalog (missing: [{}], unknown: [{}])",
                missing.join(", "),
                unknown.join(", ")
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Report persistence
// ---------------------------------------------------------------------------

const LATEST_POINTER: &str = "latest";

/// Stores every report; `reports/latest` names the most recent one.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("reports");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create reports directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a report and move the latest pointer to it. Older reports stay.
    pub fn store(&self, report: &QaReport) -> Result<PathBuf> {
        let stem = format!("qa-{}", report.timestamp.format("%Y%m%dT%H%M%S%.3fZ"));
        let mut name = format!("{stem}.json");
        let mut suffix = 1;
        while self.dir.join(&name).exists() {
            name = format!("{stem}-{suffix}.json");
            suffix += 1;
        }
        let path = self.dir.join(&name);
        let json = serde_json::to_string_pretty(report).context("failed to serialize QA report")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write QA report '{}'", path.display()))?;

        let pointer = self.dir.join(LATEST_POINTER);
        let staging = self.dir.join(format!(".{LATEST_POINTER}.tmp"));
        std::fs::write(&staging, &name)
            .with_context(|| format!("failed to write report pointer '{}'", staging.display()))?;
        std::fs::rename(&staging, &pointer)
            .with_context(|| format!("failed to update report pointer '{}'", pointer.display()))?;
        Ok(path)
    }

    pub fn latest_path(&self) -> Result<Option<PathBuf>> {
        let pointer = self.dir.join(LATEST_POINTER);
        if !pointer.exists() {
            return Ok(None);
        }
        let name = std::fs::read_to_string(&pointer)
            .with_context(|| format!("failed to read report pointer '{}'", pointer.display()))?;
        let name = name.trim();
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(anyhow::anyhow!(
                "report pointer '{}' names an invalid file '{}'",
                pointer.display(),
                name
            ));
        }
        Ok(Some(self.dir.join(name)))
    }

    pub fn latest(&self) -> Result<Option<QaReport>> {
        let Some(path) = self.latest_path()? else {
            return Ok(None);
        };
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read QA report '{}'", path.display()))?;
        parse_report(&json)
            .with_context(|| format!("failed to load QA report '{}'", path.display()))
            .map(Some)
    }

    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list reports in '{}'", self.dir.display()))?
        {
            let entry = entry?;
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Fix tasks
// ---------------------------------------------------------------------------

pub const BUILD_BROKEN_STANDARD: &str = "BUILD";

/// A routed instruction to a worker describing one failed standard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixTask {
    pub target: String,
    pub standard_id: String,
    pub description: String,
    pub error: String,
    pub required_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub cycle: u32,
}

impl FixTask {
    /// Message body: the trigger headline followed by the document.
    pub fn message_body(&self) -> String {
        format!(
            "FIX_TASK: {} failed\n\n{}",
            self.standard_id,
            self.render_document()
        )
    }

    pub fn render_document(&self) -> String {
        let mut out = format!("# Fix task: {}\n\n", self.standard_id);
        out.push_str(&format!("- Target feature: {}\n", self.target));
        out.push_str(&format!(
            "- Assigned: {}\n",
            format_timestamp(&self.created_at)
        ));
        out.push_str(&format!("- Cycle: {}\n\n", self.cycle));
        out.push_str(&format!(
            "## Failed standard\n\n{}: {}\n\n",
            self.standard_id, self.description
        ));
        out.push_str(&format!("## Error details\n\n{}\n\n", self.error.trim()));
        out.push_str("## Required actions\n\n");
        for (index, action) in self.required_actions.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", index + 1, action));
        }
        out
    }

    /// Write the document under `<root>/fix-tasks/<target>/`.
    pub fn save(&self, root: &Path) -> Result<PathBuf> {
        let dir = root.join("fix-tasks").join(&self.target);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create fix task directory '{}'", dir.display()))?;
        let safe_id = self
            .standard_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
            .collect::<String>();
        let path = dir.join(format!("cycle-{}-{}.md", self.cycle, safe_id));
        std::fs::write(&path, self.render_document())
            .with_context(|| format!("failed to write fix task '{}'", path.display()))?;
        Ok(path)
    }
}

pub fn default_required_actions(standard_id: &str) -> Vec<String> {
    if standard_id == BUILD_BROKEN_STANDARD {
        return vec![
            "Reproduce the build failure on the merged trunk".to_string(),
            "Fix the breakage on your feature branch".to_string(),
            "Report IN_PROGRESS now and COMPLETE once the branch builds cleanly".to_string(),
        ];
    }
    vec![
        format!("Reproduce the failure of {standard_id} against a running instance"),
        "Fix the behavior on your feature branch and commit".to_string(),
        "Report IN_PROGRESS now and COMPLETE once the standard passes locally".to_string(),
    ]
}
