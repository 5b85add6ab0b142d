use anyhow::Result;
use clap::{Parser, Subcommand};
use relay::config::{RelayConfig, default_config_path};
use relay::logging::{self, LogOptions};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "relay")]
#[command(version, about = "Durable fan-out/fan-in orchestration for supervisor runs")]
pub struct Cli {
    /// Path to relay.toml (default: .relay/relay.toml)
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the config file and the store
    Init,
    /// Run the callback server, barrier sweeper and worker pool
    Serve {
        /// Serve callbacks only; leave the queue to `relay worker` processes
        #[arg(long)]
        no_workers: bool,
    },
    /// Run a worker pool without the callback server
    Worker,
    /// Queue a new supervisor run
    Submit {
        /// Run input; text that isn't JSON is submitted as a string
        input: String,
    },
    /// Show a run with its current barrier
    Status {
        run_id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a queued, running or waiting run
    Cancel { run_id: i64 },
    /// Time out expired barriers once and resume their runs
    Sweep,
    /// Show queue entry counts by status
    Queue,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the file contents and effective values
    Show,
    /// Check the configuration for problems
    Validate,
    /// Write a default relay.toml
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, command.clone());
    }

    let config = RelayConfig::load_or_default(&config_path)?;
    let _log_guard = logging::init(LogOptions {
        verbose: cli.verbose,
        json: cli.json_logs || config.logging.json,
        directory: config.logging.directory.as_deref(),
    })?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config_path, &config)?,
        Commands::Serve { no_workers } => cmd::cmd_serve(&config, !no_workers).await?,
        Commands::Worker => cmd::cmd_worker(&config).await?,
        Commands::Submit { input } => cmd::cmd_submit(&config, input).await?,
        Commands::Status { run_id, json } => cmd::cmd_status(&config, *run_id, *json).await?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&config, *run_id).await?,
        Commands::Sweep => cmd::cmd_sweep(&config).await?,
        Commands::Queue => cmd::cmd_queue(&config).await?,
        Commands::Config { .. } => {}
    }
    Ok(())
}
