#![deny(unsafe_code)]

mod commands;
mod config;
mod exit_code;
mod output;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use drivesync_bridge::{
    BridgeError, BrokerError, CatalogError, CursorError, EnumerationError, ErrorCategory,
    StoreError,
};
use tracing_subscriber::EnvFilter;

use crate::commands::{bookmark, catalog, pick, show_config};
use crate::config::Config;

/// Command-line interface for the DriveSync filesystem bridge
#[derive(Parser)]
#[command(name = "drivesync")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Bookmark a folder and check access later
    TOKEN=$(drivesync bookmark create ~/Projects)
    drivesync bookmark access \"$TOKEN\"

    # Choose a folder interactively
    drivesync pick --read-only

    # Inspect a catalog store
    drivesync catalog ls ~/.local/share/drivesync/catalog.json
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (defaults to ~/.config/drivesync/config.toml)
    #[arg(long, env = "DRIVESYNC_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, resolve, and test bookmark tokens
    Bookmark(bookmark::Args),

    /// Choose a folder interactively and print its bookmark
    Pick(pick::Args),

    /// Inspect a catalog store
    Catalog(catalog::Args),

    /// Show the effective configuration
    Config(show_config::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            let code = categorize_error(&e);

            let args: Vec<String> = std::env::args().collect();
            let is_quiet = args.iter().any(|a| a == "-q" || a == "--quiet");

            if !is_quiet {
                eprintln!("Error: {e:#}");
            }

            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    if !cli.quiet {
        let verbosity = if cli.verbose > 0 {
            cli.verbose
        } else {
            config.defaults.verbosity.unwrap_or(0)
        };
        setup_tracing(verbosity);
    }

    match &cli.command {
        Commands::Bookmark(args) => bookmark::execute(args, &config.bridge),
        Commands::Pick(args) => pick::execute(args, &config.bridge),
        Commands::Catalog(args) => catalog::execute(args, &config.bridge),
        Commands::Config(args) => show_config::execute(args, &config),
    }
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(broker_err) = cause.downcast_ref::<BrokerError>() {
            if matches!(broker_err, BrokerError::AccessDenied { .. }) {
                return exit_code::ACCESS_DENIED;
            }
            return from_category(broker_err.into());
        }

        if let Some(bridge_err) = cause.downcast_ref::<BridgeError>() {
            if matches!(bridge_err, BridgeError::Broker(BrokerError::AccessDenied { .. })) {
                return exit_code::ACCESS_DENIED;
            }
            return from_category(bridge_err.category());
        }

        if let Some(err) = cause.downcast_ref::<EnumerationError>() {
            return from_category(err.into());
        }
        if let Some(err) = cause.downcast_ref::<CatalogError>() {
            return from_category(err.into());
        }
        if let Some(err) = cause.downcast_ref::<CursorError>() {
            return from_category(err.into());
        }
        if let Some(err) = cause.downcast_ref::<StoreError>() {
            return from_category(err.into());
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::PermissionDenied => return exit_code::ACCESS_DENIED,
                io::ErrorKind::NotFound => return exit_code::NOT_FOUND,
                io::ErrorKind::Interrupted => return exit_code::CANCELLED,
                _ => {}
            }
        }
    }

    exit_code::GENERAL_ERROR
}

fn from_category(category: ErrorCategory) -> u8 {
    match category {
        ErrorCategory::NotFound => exit_code::NOT_FOUND,
        ErrorCategory::Contention => exit_code::BUSY,
        ErrorCategory::UserDeclined => exit_code::CANCELLED,
        ErrorCategory::Inconsistency | ErrorCategory::Transient | ErrorCategory::Internal => {
            exit_code::GENERAL_ERROR
        }
    }
}
