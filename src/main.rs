use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use foreman::cli::{Cli, Commands, ProfileCommands, QaCommands, StatusCommands, TelemetryCommands};
use foreman::commands::{
    run_inbox, run_init, run_markers, run_qa_latest, run_qa_submit, run_send, run_status_set,
    run_status_show, run_supervisor,
};
use foreman::config::{load_profiles, resolve_runtime_config};
use foreman::doctor::run_doctor;
use foreman::error::{categorize_error, format_cli_error};
use foreman::profiles::{run_profiles_list, run_profiles_show};
use foreman::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match run_cli(cli).await {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(err) => {
            eprintln!("{}", format_cli_error(&err));
            tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<i32> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let mut code = 0;
    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Run => {
            let outcome = run_supervisor(&cfg, TelemetrySink::new(&cfg)).await?;
            code = outcome.exit_code();
        }
        Commands::Send { from, to, body } => run_send(&cfg, &from, &to, &body.join(" "))?,
        Commands::Inbox { agent, peek } => run_inbox(&cfg, &agent, peek)?,
        Commands::Status { command } => match command {
            StatusCommands::Set { agent, state, note } => {
                run_status_set(&cfg, &agent, state, &note.join(" "))?
            }
            StatusCommands::Show { agent } => run_status_show(&cfg, agent.as_deref())?,
        },
        Commands::Qa { command } => match command {
            QaCommands::Submit { report } => run_qa_submit(&cfg, Path::new(&report))?,
            QaCommands::Latest => run_qa_latest(&cfg)?,
        },
        Commands::Markers => run_markers(&cfg)?,
        Commands::Doctor => run_doctor(&cfg).await?,
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg)?,
            ProfileCommands::Show => run_profiles_show(&cfg)?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                run_telemetry_report(&cfg, path, limit)?
            }
        },
    }
    Ok(code)
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
