use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use concern_sync::config::SyncSettings;
use concern_sync::error::{Classify, ErrorClassifier, RemoteFailure, SyncError};
use concern_sync::logging::{init_logging, LoggingConfig};
use concern_sync::simulation::{self, Scenario};

#[derive(Parser, Debug)]
#[command(name = "concern-sync")]
#[command(version)]
#[command(about = "Debounced, retrying status sync for proofreading concerns")]
struct Cli {
    /// Suppress all log output except errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short, action = ArgAction::Count, conflicts_with = "quiet", global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify a remote failure message and print the result as JSON
    Classify {
        /// Failure message returned by the remote store
        message: String,

        /// HTTP status code that came with the failure
        #[arg(long)]
        status_code: Option<u16>,
    },
    /// Simulate rapid status changes against a flaky remote store
    Simulate {
        /// Settings file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Number of concerns being edited
        #[arg(long, default_value = "3")]
        concerns: usize,

        /// Status changes per concern
        #[arg(long, default_value = "4")]
        flips: usize,

        /// Pause between rounds of changes, in milliseconds
        #[arg(long, default_value = "100")]
        interval_ms: u64,

        /// Calls to fail per concern before the remote store recovers
        #[arg(long, default_value = "0")]
        fail_first: u32,

        /// Failure message returned while failing
        #[arg(long, default_value = "network error")]
        failure: String,

        /// HTTP status code returned while failing
        #[arg(long)]
        failure_status: Option<u16>,
    },
    /// Print the effective settings as TOML
    Config {
        /// Settings file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Exit codes for the simulate command
mod exit_codes {
    use std::process::ExitCode;

    /// Displayed statuses match the remote store
    pub fn converged() -> ExitCode {
        ExitCode::SUCCESS
    }

    /// Displayed statuses and the remote store disagree
    pub fn diverged() -> ExitCode {
        ExitCode::from(1)
    }
}

fn remote_failure(message: String, status_code: Option<u16>) -> RemoteFailure {
    match status_code {
        Some(code) => RemoteFailure::with_status(code, message),
        None => RemoteFailure::new(message),
    }
}

fn load_settings(path: Option<&Path>) -> Result<SyncSettings, SyncError> {
    match path {
        Some(path) => SyncSettings::load(path),
        None => SyncSettings::from_env(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(LoggingConfig::from_flags(cli.verbose, cli.quiet));

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Commands::Classify {
            message,
            status_code,
        } => {
            let classified = ErrorClassifier::new().classify(&remote_failure(message, status_code));
            println!("{}", serde_json::to_string_pretty(&classified)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Simulate {
            config,
            concerns,
            flips,
            interval_ms,
            fail_first,
            failure,
            failure_status,
        } => {
            let settings = load_settings(config.as_deref())?;
            let scenario = Scenario {
                concerns,
                flips,
                interval: Duration::from_millis(interval_ms),
                fail_first,
                failure: remote_failure(failure, failure_status),
            };

            let report = simulation::run(settings.to_queue_config(), &scenario).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if report.converged {
                Ok(exit_codes::converged())
            } else {
                tracing::warn!("displayed statuses diverged from the remote store");
                Ok(exit_codes::diverged())
            }
        }
        Commands::Config { config } => {
            let settings = load_settings(config.as_deref())?;
            print!("{}", settings.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
