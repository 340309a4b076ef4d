//! bothost: supervise long-running bot processes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bh_core::config::HostConfig;
use bh_daemon::commands;
use bh_daemon::daemon::Daemon;
use bh_daemon::shutdown::wait_for_os_signal;
use clap::{Parser, Subcommand};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// bothost -- launch, watch and restart bot processes.
#[derive(Parser)]
#[command(name = "bothost", version, about)]
struct Cli {
    /// Host config file (default: ~/.bothost/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data root, overriding `paths.root` from the config file.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the supervisor and run until ctrl-c or SIGTERM (default).
    Run,

    /// Show recorded bot statuses.
    Status {
        /// Show one bot in detail.
        id: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the tail of a bot's log.
    Logs {
        id: String,
        /// Number of lines (default: supervisor.log_tail_default).
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },

    /// Read or change runtime settings by dotted path.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Write a backup of the state and settings documents.
    Backup,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the value at a path, e.g. `settings.log_retention_days`.
    Get { path: String },
    /// Set a path to a JSON value (bare words are stored as strings).
    Set { path: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.root.as_deref())?;

    match cli.command {
        None | Some(Commands::Run) => run(config).await,
        Some(Commands::Status { id, json }) => {
            init_quiet_logging(&config);
            print!("{}", commands::status::render(&config, id.as_deref(), json)?);
            Ok(())
        }
        Some(Commands::Logs { id, lines }) => {
            init_quiet_logging(&config);
            print!("{}", commands::logs::render(&config, &id, lines)?);
            Ok(())
        }
        Some(Commands::Config { action }) => {
            init_quiet_logging(&config);
            let out = match action {
                ConfigAction::Get { path } => commands::config::get(&config, &path)?,
                ConfigAction::Set { path, value } => commands::config::set(&config, &path, &value)?,
            };
            print!("{out}");
            Ok(())
        }
        Some(Commands::Backup) => {
            init_quiet_logging(&config);
            print!("{}", commands::backup::run(config)?);
            Ok(())
        }
    }
}

async fn run(config: HostConfig) -> Result<()> {
    bh_telemetry::logging::init("bothost", &config.general.log_level, config.general.json_logs);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "bothost starting");

    let daemon = Daemon::boot(config)?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c and SIGTERM to trigger graceful shutdown.
    tokio::spawn(async move {
        match wait_for_os_signal().await {
            Ok(signal) => {
                info!(signal, "signal received, initiating shutdown");
                shutdown.trigger();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signals"),
        }
    });

    daemon.run().await
}

/// Subcommands only surface warnings; their stdout is the command output.
fn init_quiet_logging(config: &HostConfig) {
    bh_telemetry::logging::init("bothost", "warn", config.general.json_logs);
}

fn load_config(path: Option<&std::path::Path>, root: Option<&std::path::Path>) -> Result<HostConfig> {
    let mut config = match path {
        Some(path) => HostConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => HostConfig::load().context("failed to load host config")?,
    };
    if let Some(root) = root {
        config.paths.root = root.to_string_lossy().into_owned();
    }
    Ok(config)
}
