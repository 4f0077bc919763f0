//! Scenario CLI - validate and run YAML command scenarios.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod process;

#[derive(Parser)]
#[command(name = "scenario")]
#[command(about = "YAML-scripted scenario runner for command-line clients", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check scenario files against the schema
    Validate {
        /// Scenario files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the release tracks a scenario declares
    Tracks {
        /// Scenario file
        path: PathBuf,
    },
    /// Run a scenario against an executable
    Run {
        /// Scenario file
        path: PathBuf,
        /// Executable invoked for every execute_command
        #[arg(long)]
        program: PathBuf,
        /// Release track to run (default: the first declared track)
        #[arg(long, conflicts_with = "all_tracks")]
        track: Option<String>,
        /// Run every declared release track
        #[arg(long)]
        all_tracks: bool,
        /// Update modes, comma-separated (RESULT, API_REQUESTS, API_RESPONSES, RESPONSE_PAYLOADS, UX, all)
        #[arg(long)]
        update: Option<String>,
        /// Config file (default: $SCENARIO_CONFIG or ./scenario.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize tracing subscriber
    // Respects RUST_LOG environment variable (e.g., RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { paths } => commands::validate::run(&paths),
        Commands::Tracks { path } => commands::tracks::run(&path),
        Commands::Run {
            path,
            program,
            track,
            all_tracks,
            update,
            config,
        } => commands::run::run(commands::run::RunArgs {
            path,
            program,
            track,
            all_tracks,
            update,
            config,
        }),
    }
}
