//! CLI entry point for station-daq
//!
//! Subcommands:
//! - `run`: collect, stage and upload until SIGTERM or Ctrl-C
//! - `check`: load and validate the configuration, then exit
//! - `upload`: run one transfer cycle over the staging directory
//!
//! # Usage
//!
//! ```bash
//! station-daq run --config /etc/station/station.toml
//! station-daq check --config config/station.example.toml
//! ```
//!
//! Exit status is 0 on clean shutdown, 2 for configuration errors, 3 when the
//! archive credentials cannot be used and 1 for anything else.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use station_daq::app::StationApp;
use station_daq::config::StationConfig;
use station_daq::transfer::sftp::SftpConnector;
use station_daq::transfer::Connector;
use station_daq::{logging, DaqError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "station-daq")]
#[command(about = "Unattended telemetry collector for measurement stations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector until stopped
    Run {
        /// Station configuration file
        #[arg(long, short, default_value = "config/station.toml")]
        config: PathBuf,
    },

    /// Validate the configuration and credentials
    Check {
        /// Station configuration file
        #[arg(long, short, default_value = "config/station.toml")]
        config: PathBuf,
    },

    /// Upload everything currently staged, once
    Upload {
        /// Station configuration file
        #[arg(long, short, default_value = "config/station.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Check { config } => check(config),
        Commands::Upload { config } => upload(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "station-daq failed");
            eprintln!("station-daq: {e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

fn exit_status(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<DaqError>() {
        Some(DaqError::Config(_) | DaqError::Configuration(_)) => 2,
        Some(DaqError::Authentication(_)) => 3,
        _ => 1,
    }
}

fn load(path: &Path) -> Result<StationConfig> {
    let config = StationConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(DaqError::Configuration)
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

fn check_credentials(config: &StationConfig) -> Result<()> {
    if !config.transfer.enabled {
        return Ok(());
    }
    if let Some(sftp) = &config.sftp {
        SftpConnector::new(sftp.clone())
            .check_credentials()
            .context("checking archive credentials")?;
    }
    Ok(())
}

async fn run(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    logging::init_from_config(&config).map_err(DaqError::Configuration)?;
    check_credentials(&config)?;

    let mut app = StationApp::build(config).context("building station")?;
    app.start()?;

    wait_for_stop().await?;
    app.shutdown().await.context("shutting down")?;
    Ok(())
}

fn check(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    check_credentials(&config)?;

    println!("Configuration OK: {}", path.display());
    for line in summary(&config) {
        println!("  {line}");
    }
    Ok(())
}

/// One line per enabled instrument, framed by the station name and the
/// transfer endpoint.
fn summary(config: &StationConfig) -> Vec<String> {
    let mut lines = vec![format!("station:  {}", config.application.name)];
    for spec in config.enabled_instruments() {
        lines.push(format!("{:<12} {:<10} every {:?}", spec.id, spec.kind, spec.sampling_interval));
    }
    match (&config.sftp, config.transfer.enabled) {
        (Some(sftp), true) => lines.push(format!("transfer: {}", SftpConnector::new(sftp.clone()).describe())),
        _ => lines.push("transfer: disabled".to_string()),
    }
    lines
}

async fn upload(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    logging::init_from_config(&config).map_err(DaqError::Configuration)?;
    check_credentials(&config)?;

    let app = StationApp::build(config).context("building station")?;
    let report = app.upload_once().await?;
    println!(
        "uploaded {} (already present {}), failed {}, skipped {}",
        report.uploaded, report.already_present, report.failed, report.skipped
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = term.recv() => tracing::info!("received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            tracing::info!("received Ctrl-C");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("received Ctrl-C");
    Ok(())
}
