//! Main application entry point for the pharos web server host.
//!
//! Reads the JSON configuration, brings up the server, hands the plugin
//! records to the supervisor, and then waits for SIGINT to unwind it all
//! in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use server_core::config::HostConfig;
use server_core::{
    DiagnosticDelegate, DynServer, DynamicLinker, HostServer, PluginSupervisor, PollingWatcher,
    Server,
};

/// How often the image directory is polled for changes.
const WATCH_PERIOD: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "pharos")]
#[command(about = "Pluggable web server host")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Configuration lookup order: the explicit path, then `config.json` in the
/// working directory, then `config.json` beside the executable.
fn find_config_file(
    explicit: Option<PathBuf>,
    working_dir: &Path,
    exe_parent: &Path,
) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path);
    }
    candidates.push(working_dir.join("config.json"));
    candidates.push(exe_parent.join("config.json"));
    candidates.into_iter().find(|path| path.is_file())
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();

    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_path = find_config_file(
        cli.config,
        &working_dir,
        &server_core::config::exe_parent(),
    )
    .context("unable to open configuration file")?;
    let config = HostConfig::load(&config_path)?;
    info!("configuration loaded from {}", config_path.display());

    run(config).await
}

async fn run(config: HostConfig) -> Result<()> {
    let server = HostServer::new();

    // Surface every diagnostic through the log, in the
    // "<sender>[<level>]: <message>" convention.
    let reporter = server.subscribe_diagnostics(
        Arc::new(|sender: &str, level: usize, message: &str| match level {
            0 | 1 => info!("{sender}[{level}]: {message}"),
            2 => warn!("{sender}[{level}]: {message}"),
            _ => error!("{sender}[{level}]: {message}"),
        }),
        0,
    );

    for (key, value) in config.server_items() {
        server.set_configuration_item(&key, &value);
    }
    server
        .mobilize(config.secure)
        .await
        .context("unable to start the server")?;
    info!("Web server up and running.");

    let image_dir = config.image_directory();
    let runtime_dir = config.runtime_directory();
    if let Err(e) = tokio::fs::create_dir_all(&runtime_dir).await {
        warn!(
            "unable to create plugin runtime directory {}: {e}",
            runtime_dir.display()
        );
    }
    let records = config.plugin_records(&image_dir, &runtime_dir, Arc::new(DynamicLinker));
    let handle: DynServer = server.clone();
    let diagnostics: DiagnosticDelegate = {
        let server = server.clone();
        Arc::new(move |sender: &str, level: usize, message: &str| {
            server.publish_diagnostic(sender, level, message);
        })
    };
    let mut supervisor = PluginSupervisor::new(handle, diagnostics, records);
    supervisor.scan_once().await;
    supervisor.start_background(Box::new(PollingWatcher::new(image_dir, WATCH_PERIOD)))?;

    tokio::signal::ctrl_c()
        .await
        .context("unable to listen for the shutdown signal")?;
    info!("shutdown signal received");

    supervisor.stop_background().await;
    supervisor.unload_all().await;
    server.demobilize().await;
    drop(reporter);
    info!("Exiting...");
    Ok(())
}
