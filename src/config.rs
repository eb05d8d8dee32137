use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::bus::{BROADCAST_AGENT, SUPERVISOR_AGENT, UNKNOWN_OWNER};
use crate::cli::*;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub root: PathBuf,
    pub repo_dir: PathBuf,
    pub trunk: String,
    pub poll_interval: Duration,
    pub max_cycles: u32,
    pub delivery_mode: DeliveryMode,
    pub qa_agent: String,
    pub features: Vec<Feature>,
    pub ownership: BTreeMap<String, String>,
    pub standards_catalog: Option<PathBuf>,
    pub build: BuildSettings,
    pub build_failure_routing: BuildFailureRouting,
    pub pull_request: PullRequestSettings,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

impl RuntimeConfig {
    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.name == name)
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }

    /// Every agent that takes part in a run: features in registration order, then QA.
    pub fn known_agents(&self) -> Vec<String> {
        let mut agents = self.feature_names();
        agents.push(self.qa_agent.clone());
        agents
    }
}

/// A registered feature and the worktree its worker owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub branch: String,
    pub directory: PathBuf,
    pub status_log: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub install: Option<String>,
    pub check: Option<String>,
    pub start: Option<String>,
    pub smoke_grace: Duration,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSettings {
    pub enabled: bool,
    pub remote: String,
    pub base: Option<String>,
    pub draft: bool,
    pub supported_hosts: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub root: Option<String>,
    pub repo_dir: Option<String>,
    pub trunk: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub max_cycles: Option<u32>,
    pub delivery_mode: Option<DeliveryMode>,
    pub qa_agent: Option<String>,
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
    #[serde(default)]
    pub ownership: BTreeMap<String, String>,
    pub standards_catalog: Option<String>,
    #[serde(default)]
    pub build: BuildConfig,
    pub build_failure_routing: Option<BuildFailureRouting>,
    #[serde(default)]
    pub pull_request: PullRequestConfig,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    pub name: String,
    pub branch: Option<String>,
    pub directory: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub install: Option<String>,
    pub check: Option<String>,
    pub start: Option<String>,
    pub smoke_grace_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullRequestConfig {
    pub enabled: Option<bool>,
    pub remote: Option<String>,
    pub base: Option<String>,
    pub draft: Option<bool>,
    #[serde(default)]
    pub supported_hosts: Vec<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check feature/build values and field names.",
            path.display()
        )
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_features(root: &Path, raw: &[FeatureConfig], qa_agent: &str) -> Result<Vec<Feature>> {
    let mut seen = BTreeSet::<String>::new();
    let mut features = Vec::with_capacity(raw.len());

    for entry in raw {
        let name = entry.name.trim().to_string();
        if name.is_empty() {
            return Err(anyhow::anyhow!("feature name cannot be empty"));
        }
        if name.chars().any(|ch| ch.is_whitespace() || ch == '/') {
            return Err(anyhow::anyhow!(
                "feature name '{}' must not contain whitespace or '/'",
                name
            ));
        }
        if [SUPERVISOR_AGENT, BROADCAST_AGENT, UNKNOWN_OWNER, qa_agent].contains(&name.as_str()) {
            return Err(anyhow::anyhow!(
                "feature name '{}' is reserved for a protocol agent",
                name
            ));
        }
        if !seen.insert(name.clone()) {
            return Err(anyhow::anyhow!("feature '{}' is registered twice", name));
        }

        let branch =
            non_empty(entry.branch.clone()).unwrap_or_else(|| format!("feature/{name}"));
        let directory = non_empty(entry.directory.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("worktrees").join(&name));
        features.push(Feature {
            status_log: root.join("status").join(format!("{name}.log")),
            name,
            branch,
            directory,
        });
    }

    Ok(features)
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let root = PathBuf::from(
        non_empty(cli.root.clone())
            .or(profile.root.clone())
            .unwrap_or_else(|| ".foreman".to_string()),
    );
    let qa_agent = non_empty(cli.qa_agent.clone())
        .or(non_empty(profile.qa_agent.clone()))
        .unwrap_or_else(|| "qa".to_string());
    if [SUPERVISOR_AGENT, BROADCAST_AGENT, UNKNOWN_OWNER].contains(&qa_agent.as_str()) {
        return Err(anyhow::anyhow!(
            "qa agent id '{}' is reserved. Choose another --qa-agent.",
            qa_agent
        ));
    }

    let features = resolve_features(&root, &profile.features, &qa_agent)?;
    for (standard, owner) in &profile.ownership {
        if !features.iter().any(|feature| &feature.name == owner) {
            return Err(anyhow::anyhow!(
                "ownership entry '{}' points at unregistered feature '{}'",
                standard,
                owner
            ));
        }
    }

    let build = BuildSettings {
        install: non_empty(profile.build.install.clone()),
        check: non_empty(profile.build.check.clone()),
        start: non_empty(profile.build.start.clone()),
        smoke_grace: Duration::from_secs(profile.build.smoke_grace_secs.unwrap_or(10)),
        command_timeout: Duration::from_secs(
            profile.build.command_timeout_secs.unwrap_or(900).max(1),
        ),
    };

    let pull_request = PullRequestSettings {
        enabled: profile.pull_request.enabled.unwrap_or(true),
        remote: non_empty(profile.pull_request.remote.clone())
            .unwrap_or_else(|| "origin".to_string()),
        base: non_empty(profile.pull_request.base.clone()),
        draft: profile.pull_request.draft.unwrap_or(false),
        supported_hosts: if profile.pull_request.supported_hosts.is_empty() {
            vec!["github.com".to_string()]
        } else {
            profile.pull_request.supported_hosts.clone()
        },
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        repo_dir: PathBuf::from(
            non_empty(cli.repo_dir.clone())
                .or(profile.repo_dir.clone())
                .unwrap_or_else(|| ".".to_string()),
        ),
        trunk: non_empty(cli.trunk.clone())
            .or(profile.trunk.clone())
            .unwrap_or_else(|| "main".to_string()),
        poll_interval: Duration::from_secs(
            cli.poll_interval_secs
                .or(profile.poll_interval_secs)
                .unwrap_or(30)
                .max(1),
        ),
        max_cycles: cli.max_cycles.or(profile.max_cycles).unwrap_or(3).max(1),
        delivery_mode: cli
            .delivery_mode
            .or(profile.delivery_mode)
            .unwrap_or(DeliveryMode::Push),
        qa_agent,
        features,
        ownership: profile.ownership.clone(),
        standards_catalog: non_empty(profile.standards_catalog.clone()).map(PathBuf::from),
        build,
        build_failure_routing: profile
            .build_failure_routing
            .unwrap_or(BuildFailureRouting::LastMerged),
        pull_request,
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| root.join("telemetry/events.jsonl").display().to_string()),
        root,
    })
}
