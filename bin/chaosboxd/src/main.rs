//! ---
//! cbx_section: "04-daemon"
//! cbx_subsection: "binary"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Binary entrypoint for the chaosbox daemon."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chaosbox_common::config::AppConfig;
use chaosbox_common::logging::init_tracing;
use chaosbox_engine::{
    ChaosMetrics, ChaosSession, Collaborators, DatabaseHandle, Outcome, RemoteExecutor,
    ScenarioDefinition, SessionConfig,
};
use chaosbox_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};

mod transport;

use transport::{LoggingDatabase, LoggingExecutor, MysqlCliHandle, SshExecutor};

const EXIT_FAILED: u8 = 2;
const EXIT_PARTIALLY_CLEANED: u8 = 3;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "chaosbox fault-injection daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run one chaos scenario against the configured target")]
    Run {
        #[arg(long, short = 's', value_name = "FILE", help = "Scenario definition (TOML)")]
        scenario: PathBuf,
        #[arg(long, help = "Log commands and statements instead of executing them")]
        dry_run: bool,
    },
    #[command(about = "Validate a scenario definition without touching the target")]
    Validate {
        #[arg(long, short = 's', value_name = "FILE", help = "Scenario definition (TOML)")]
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let validating = matches!(cli.command, Commands::Validate { .. });

    let load_started = Instant::now();
    let (config, config_path) = load_config(cli.config.as_deref(), validating)?;
    let load_duration = load_started.elapsed();

    let daemon_metrics = DaemonMetrics::new(new_registry())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());

    match cli.command {
        Commands::Validate { scenario } => {
            daemon_metrics.inc_run("validate");
            let summary = validate_scenario(&config, &scenario)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { scenario, dry_run } => {
            init_tracing("chaosboxd", &config.logging)?;
            match &config_path {
                Some(path) => info!(config_path = %path.display(), "configuration loaded"),
                None => info!("configuration defaults in use"),
            }
            daemon_metrics.inc_run("run");
            run_scenario(config, &scenario, dry_run, &daemon_metrics).await
        }
    }
}

fn config_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from("configs/chaosbox.toml"));
    candidates.push(PathBuf::from("/etc/chaosbox/chaosbox.toml"));
    candidates
}

/// Validation works without a config file; running does not.
fn load_config(explicit: Option<&Path>, allow_defaults: bool) -> Result<(AppConfig, Option<PathBuf>)> {
    match AppConfig::load_with_source(&config_candidates(explicit)) {
        Ok(loaded) => Ok((loaded.config, Some(loaded.source))),
        Err(_) if allow_defaults && explicit.is_none() => Ok((AppConfig::default(), None)),
        Err(err) => Err(err),
    }
}

fn validate_scenario(config: &AppConfig, path: &Path) -> Result<serde_json::Value> {
    let scenario = ScenarioDefinition::from_file(path)?.into_scenario(&config.target.host)?;
    Ok(json!({
        "target": scenario.target(),
        "host": scenario.host(),
        "scenario": scenario.kind(),
        "duration_seconds": scenario.duration().as_secs_f64(),
        "parameters": scenario.parameters_json(),
    }))
}

async fn run_scenario(
    config: AppConfig,
    path: &Path,
    dry_run: bool,
    daemon_metrics: &DaemonMetrics,
) -> Result<ExitCode> {
    let scenario = ScenarioDefinition::from_file(path)?.into_scenario(&config.target.host)?;
    info!(
        instance = %scenario.target(),
        host = %scenario.host(),
        scenario = %scenario.kind(),
        duration = ?scenario.duration(),
        dry_run,
        "scenario loaded"
    );

    let registry = daemon_metrics.registry();
    let sink = Arc::new(ChaosMetrics::new(registry.clone())?);
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let (executor, database): (Arc<dyn RemoteExecutor>, Arc<dyn DatabaseHandle>) = if dry_run {
        warn!("dry run: no command or statement will reach the target");
        (
            Arc::new(LoggingExecutor),
            Arc::new(LoggingDatabase::new(config.target.name.clone())),
        )
    } else {
        if config.target.password().is_none() {
            warn!(env = %config.target.password_env, "database password not set; relying on client defaults");
        }
        (
            Arc::new(SshExecutor::from_config(&config.executor)),
            Arc::new(MysqlCliHandle::from_config(&config.target, &config.executor)),
        )
    };

    let mut session = ChaosSession::new(
        scenario,
        Collaborators::new(executor, database, sink),
        SessionConfig::from(&config.session),
    );
    let result = tokio::select! {
        result = session.run() => result,
        _ = signal::ctrl_c() => {
            warn!("ctrl-c received; interrupting scenario");
            Ok(session.finish_interrupted("ctrl-c received").await)
        }
    };

    println!("{}", serde_json::to_string_pretty(&session.summary())?);
    drop(session);

    if let Some(server) = metrics_server {
        if !config.metrics.linger.is_zero() {
            info!(linger = ?config.metrics.linger, "holding metrics exporter open for a final scrape");
            tokio::time::sleep(config.metrics.linger).await;
        }
        server.shutdown().await?;
    }

    let outcome = result?;
    match &outcome {
        Outcome::Success => info!("scenario completed"),
        Outcome::Failed(reason) => warn!(%reason, "scenario failed; target restored"),
        Outcome::PartiallyCleaned(reason) => {
            error!(%reason, "target may still be degraded; manual inspection required")
        }
    }
    Ok(ExitCode::from(exit_status(&outcome)))
}

fn exit_status(outcome: &Outcome) -> u8 {
    match outcome {
        Outcome::Success => 0,
        Outcome::Failed(_) => EXIT_FAILED,
        Outcome::PartiallyCleaned(_) => EXIT_PARTIALLY_CLEANED,
    }
}
