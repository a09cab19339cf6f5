//! `rise-host` — the plugin host binary: wires config → engine → supervisor
//! → watcher and runs the engine until Ctrl-C. Logging setup mirrors the
//! teacher's `rocode-cli::main` (file-backed `tracing_subscriber` with an
//! `EnvFilter`, falling back to stderr if the log directory can't be
//! created).

mod cli;
mod config;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands};
use config::HostConfigFile;
use rise_engine::Engine;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let file = HostConfigFile::load_or_default(&config_path)?;
    let _log_guard = init_logging(&config::log_level(&file));

    let engine_config = config::resolve(file, cli.plugins_dir.clone());
    tracing::info!(plugins_dir = %engine_config.plugins_dir.display(), "starting rise-host");

    let engine = Engine::new(engine_config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(engine).await,
        Commands::Check => check(engine).await,
    }
}

async fn run(engine: Arc<Engine>) -> anyhow::Result<()> {
    let report = engine.discover_and_start().await?;
    log_startup_report(&report);

    tokio::select! {
        result = repl::run(Arc::clone(&engine)) => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "REPL loop ended with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, shutting down");
        }
    }

    engine.shutdown_all().await;
    Ok(())
}

/// `rise-host check`: run discovery once, print the startup report, and
/// exit — useful for validating a plugins directory in CI without holding
/// an interactive session open.
async fn check(engine: Arc<Engine>) -> anyhow::Result<()> {
    let report = engine.discover_and_start().await?;
    log_startup_report(&report);
    engine.shutdown_all().await;
    if !report.failed.is_empty() {
        anyhow::bail!("{} plugin(s) failed to start", report.failed.len());
    }
    Ok(())
}

fn log_startup_report(report: &rise_engine::StartupReport) {
    for plugin in &report.started {
        tracing::info!(plugin, "plugin started");
    }
    for (plugin, error) in &report.failed {
        tracing::warn!(plugin, error = %error, "plugin failed to start");
    }
}

fn default_config_path() -> PathBuf {
    PathBuf::from("rise.toml")
}

fn init_logging(level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("rise")
        .join("log");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "rise-host.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}
