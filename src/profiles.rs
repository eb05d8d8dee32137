use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

fn or_none(value: Option<&str>) -> &str {
    value.unwrap_or("<none>")
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Root: {}", cfg.root.display());
    println!("Repository: {}", cfg.repo_dir.display());
    println!("Trunk: {}", cfg.trunk);
    println!("Poll interval (secs): {}", cfg.poll_interval.as_secs());
    println!("Max cycles: {}", cfg.max_cycles);
    println!("Delivery mode: {:?}", cfg.delivery_mode);
    println!("QA agent: {}", cfg.qa_agent);

    if cfg.features.is_empty() {
        println!("Features: <none>");
    } else {
        println!("Features:");
        for feature in &cfg.features {
            println!(
                "- {} (branch={}, dir={})",
                feature.name,
                feature.branch,
                feature.directory.display()
            );
        }
    }
    if cfg.ownership.is_empty() {
        println!("Ownership: <none>");
    } else {
        println!("Ownership:");
        for (standard, owner) in &cfg.ownership {
            println!("- {standard} -> {owner}");
        }
    }
    println!(
        "Standards catalog: {}",
        cfg.standards_catalog
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<not configured>".to_string())
    );

    println!("Build install: {}", or_none(cfg.build.install.as_deref()));
    println!("Build check: {}", or_none(cfg.build.check.as_deref()));
    println!("Build start: {}", or_none(cfg.build.start.as_deref()));
    println!("Smoke grace (secs): {}", cfg.build.smoke_grace.as_secs());
    println!(
        "Build command timeout (secs): {}",
        cfg.build.command_timeout.as_secs()
    );
    println!("Build failure routing: {:?}", cfg.build_failure_routing);

    println!(
        "Pull request: enabled={} remote={} base={} draft={} hosts={}",
        cfg.pull_request.enabled,
        cfg.pull_request.remote,
        or_none(cfg.pull_request.base.as_deref()),
        cfg.pull_request.draft,
        cfg.pull_request.supported_hosts.join(", ")
    );
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
