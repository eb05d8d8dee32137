use anyhow::Result;

use crate::config::RuntimeConfig;
use crate::pr::{github_token_present, remote_host};
use crate::report::StandardsCatalog;
use crate::vcs::{branch_exists, run_git};

fn mark(ok: bool) -> &'static str {
    if ok { "ok" } else { "missing" }
}

async fn tool_version(program: &str) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .arg("--version")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let git = tool_version("git").await;
    let gh = tool_version("gh").await;
    println!("Tooling check:");
    println!(
        "- git: {}",
        git.as_deref().unwrap_or("missing (required for merge and worktrees)")
    );
    println!(
        "- gh: {}",
        gh.as_deref()
            .unwrap_or("missing (pull request creation will be skipped)")
    );
    println!(
        "- GH_TOKEN/GITHUB_TOKEN: {}",
        if github_token_present() { "set" } else { "not set" }
    );

    println!(
        "Root: {} ({})",
        cfg.root.display(),
        if cfg.root.is_dir() { "exists" } else { "will be created" }
    );

    if git.is_some() {
        let trunk_ok = branch_exists(&cfg.repo_dir, &cfg.trunk).await.unwrap_or(false);
        println!(
            "Repository: {} (trunk '{}': {})",
            cfg.repo_dir.display(),
            cfg.trunk,
            mark(trunk_ok)
        );
        let remote = run_git(
            &cfg.repo_dir,
            &["remote", "get-url", cfg.pull_request.remote.as_str()],
        )
        .await
        .ok()
        .filter(|output| output.success)
        .map(|output| output.stdout.trim().to_string());
        match remote {
            Some(url) => {
                let host = remote_host(&url).unwrap_or_else(|| "<unknown>".to_string());
                let supported = cfg
                    .pull_request
                    .supported_hosts
                    .iter()
                    .any(|supported| supported.eq_ignore_ascii_case(&host));
                println!(
                    "Remote '{}': {} (host {}, supported={})",
                    cfg.pull_request.remote, url, host, supported
                );
            }
            None => println!("Remote '{}': not configured", cfg.pull_request.remote),
        }
    }

    if cfg.features.is_empty() {
        println!("Features: none registered");
        println!("Tip: add [[profiles.<name>.features]] entries to {}", cfg.config_path);
    } else {
        println!("Features:");
        for feature in &cfg.features {
            let branch_ok = if git.is_some() {
                branch_exists(&cfg.repo_dir, &feature.branch)
                    .await
                    .unwrap_or(false)
            } else {
                false
            };
            println!(
                "- {}: branch {} ({}), worktree {} ({})",
                feature.name,
                feature.branch,
                mark(branch_ok),
                feature.directory.display(),
                mark(feature.directory.is_dir())
            );
        }
    }

    let build = [
        ("install", cfg.build.install.as_deref()),
        ("check", cfg.build.check.as_deref()),
        ("start", cfg.build.start.as_deref()),
    ];
    println!("Build commands:");
    for (step, command) in build {
        println!("- {step}: {}", command.unwrap_or("<not configured>"));
    }

    match cfg.standards_catalog.as_deref() {
        Some(path) => match StandardsCatalog::load(path) {
            Ok(catalog) => println!(
                "Standards catalog: {} ({} standards)",
                path.display(),
                catalog.standards.len()
            ),
            Err(err) => println!("Standards catalog: invalid ({err:#})"),
        },
        None => println!("Standards catalog: <not configured>"),
    }

    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );
    Ok(())
}
