//! Bookmark command - mint, resolve, and test bookmark tokens.
//!
//! # Examples
//!
//! ```bash
//! # Wrap a folder into a token
//! drivesync bookmark create ~/Projects --read-only
//!
//! # See where a token points now
//! drivesync bookmark resolve "$TOKEN" --json
//!
//! # Check that the token still grants access
//! drivesync bookmark access "$TOKEN"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Subcommand};
use drivesync_bridge::{AccessMode, Bookmark, BridgeConfig};
use serde::Serialize;
use tracing::instrument;

use super::filesystem_broker;

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(subcommand)]
    pub command: BookmarkCommand,
}

#[derive(Subcommand, Clone)]
pub enum BookmarkCommand {
    /// Wrap a folder into a bookmark token
    Create {
        /// Folder path or file:// URL
        location: String,

        /// Mint a read-only token
        #[arg(long)]
        read_only: bool,
    },

    /// Show where a bookmark token points now
    Resolve {
        /// Base64 token
        token: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Activate a token once and release it again
    Access {
        /// Base64 token
        token: String,
    },
}

/// JSON output format for resolve
#[derive(Serialize)]
struct Resolution {
    path: String,
    stale: bool,
    mode: AccessMode,
}

#[instrument(level = "info", name = "cmd::bookmark", skip_all)]
pub fn execute(args: &Args, config: &BridgeConfig) -> Result<()> {
    let broker = filesystem_broker(config);

    match &args.command {
        BookmarkCommand::Create {
            location,
            read_only,
        } => {
            let mode = if *read_only {
                AccessMode::ReadOnly
            } else {
                AccessMode::ReadWrite
            };
            let location = absolutize(location)?;
            let bookmark = broker
                .mint(&location, mode)
                .with_context(|| format!("Failed to bookmark {location}"))?;
            println!("{}", bookmark.to_base64());
        }
        BookmarkCommand::Resolve { token, json } => {
            let bookmark = Bookmark::from_base64(token)?;
            let resolved = broker.resolve(&bookmark)?;
            if *json {
                let out = Resolution {
                    path: resolved.path.display().to_string(),
                    stale: resolved.stale,
                    mode: resolved.mode,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{}", resolved.path.display());
                if resolved.stale {
                    eprintln!("note: folder has moved; create a fresh bookmark for it");
                }
            }
        }
        BookmarkCommand::Access { token } => {
            let bookmark = Bookmark::from_base64(token)?;
            let (session, resolved) = broker.activate(&bookmark)?;
            println!(
                "access granted: {} ({})",
                resolved.path.display(),
                session.mode()
            );
            broker.deactivate(session);
        }
    }

    Ok(())
}

/// Turn a relative path argument into an absolute one. URLs pass through.
fn absolutize(location: &str) -> Result<String> {
    if location.starts_with("file:") || Path::new(location).is_absolute() {
        return Ok(location.to_string());
    }
    let absolute = std::path::absolute(location)
        .with_context(|| format!("Failed to resolve {location}"))?;
    Ok(absolute.to_string_lossy().into_owned())
}
