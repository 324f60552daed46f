//! TokenFold CLI — the main entry point.
//!
//! Commands:
//! - `onboard`  — Write a default config
//! - `models`   — List model presets
//! - `plan`     — Show the per-stage sequence lengths a config produces
//! - `run`      — Run one forward pass and report every stage
//! - `bench`    — Run concurrent passes and summarize compute savings
//! - `config`   — Show, validate or locate the config file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "tokenfold",
    about = "TokenFold — adaptive token reduction for vision transformers",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.tokenfold/config.toml
    #[arg(short, long, global = true, env = "TOKENFOLD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the configuration directory
    Onboard,

    /// List the available model presets
    Models,

    /// Walk the trunk without running it
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one forward pass on a random batch
    Run {
        /// Override the batch size
        #[arg(short, long)]
        batch: Option<usize>,

        /// Capture selection traces per stage
        #[arg(long)]
        trace: bool,

        /// Print the stage reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run repeated passes and report compute savings
    Bench {
        /// Number of forward passes
        #[arg(short, long, default_value_t = 8)]
        passes: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate the configuration
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Models => commands::models::run().await?,
        Commands::Plan { json } => commands::plan::run(config_path, json).await?,
        Commands::Run { batch, trace, json } => {
            commands::run::run(config_path, batch, trace, json).await?
        }
        Commands::Bench { passes } => commands::bench::run(config_path, passes).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path).await?,
            ConfigAction::Validate => commands::config_cmd::validate(config_path).await?,
            ConfigAction::Path => commands::config_cmd::path(config_path).await?,
        },
    }

    Ok(())
}
