use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tron_cli::cmd;

#[derive(Parser)]
#[command(
    name = "trond",
    about = "Run scheduled jobs and supervise services across a pool of nodes",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Path to the YAML config
        #[arg(long, short = 'c', env = "TRON_CONFIG")]
        config: PathBuf,
    },

    /// Validate a config and summarise its jobs and services
    Check {
        /// Path to the YAML config
        #[arg(long, short = 'c', env = "TRON_CONFIG")]
        config: PathBuf,

        /// Output as JSON
        #[arg(long, short = 'j')]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run { config } => cmd::run::run(&config),
        Commands::Check { config, json } => cmd::check::run(&config, json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
