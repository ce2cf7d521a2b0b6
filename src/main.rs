#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # saucebridge
//!
//! Runs a test command with the full Sauce Labs build lifecycle around it:
//! environment projection, Sauce Connect tunnel supervision, and post-run
//! session correlation against the remote job records.
//!
//! ## Subcommands
//!
//! - `saucebridge run --config <file> -- <command...>` — full lifecycle run
//! - `saucebridge report --config <file>` — print the job report for the
//!   configured build
//! - `saucebridge token <username> <access-key> <job-id>` — print the embed
//!   token for a job, scoped to the current UTC hour

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use saucebridge::harness::{self, HarnessConfig};
use saucebridge::token;

/// CI build lifecycle broker for the Sauce Labs device cloud.
#[derive(Parser)]
#[command(name = "saucebridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test command with the lifecycle hooks around it.
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: PathBuf,
        /// Test command and its arguments.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Print the job report for the configured build.
    Report {
        /// Path to TOML config file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the embed token for a job.
    Token {
        username: String,
        access_key: String,
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match cli.command {
        Commands::Run { config, command } => {
            let config = match HarnessConfig::load(&config) {
                Ok(config) => config,
                Err(e) => {
                    error!("Configuration error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            match harness::run_build(config, &command).await {
                // The harness's exit code mirrors the test command's.
                Ok(code) => ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1)),
                Err(e) => {
                    error!("Build run failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Report { config } => {
            let config = match HarnessConfig::load(&config) {
                Ok(config) => config,
                Err(e) => {
                    error!("Configuration error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            match harness::print_report(&config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Report failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Token {
            username,
            access_key,
            job_id,
        } => match token::job_token(&username, &access_key, &job_id) {
            Ok(token) => {
                println!("{token}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Token computation failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}
