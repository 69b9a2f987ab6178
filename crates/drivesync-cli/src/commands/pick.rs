//! Pick command - choose a folder interactively and print its bookmark.
//!
//! The prompt reads one line from stdin: a path selects that folder, an empty line means
//! no selection, and end of input cancels.
//!
//! # Examples
//!
//! ```bash
//! drivesync pick
//! echo ~/Documents | drivesync pick --read-only
//! drivesync pick --timeout 30
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args as ClapArgs;
use drivesync_bridge::{AccessMode, BridgeConfig, FolderPicker, PickOutcome};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use super::filesystem_broker;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Mint a read-only token
    #[arg(long)]
    pub read_only: bool,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

/// Folder picker that prompts on stderr and reads stdin.
struct TerminalPicker;

#[async_trait]
impl FolderPicker for TerminalPicker {
    async fn pick(&self, cancel: CancellationToken) -> PickOutcome {
        eprint!("Folder to share (empty line for none): ");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        tokio::select! {
            () = cancel.cancelled() => PickOutcome::Cancelled,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        PickOutcome::NoSelection
                    } else {
                        PickOutcome::Selected(
                            std::path::absolute(line).unwrap_or_else(|_| PathBuf::from(line)),
                        )
                    }
                }
                Ok(None) => PickOutcome::Cancelled,
                Err(e) => {
                    warn!("failed to read selection: {}", e);
                    PickOutcome::Cancelled
                }
            },
        }
    }
}

#[instrument(level = "info", name = "cmd::pick", skip_all)]
pub fn execute(args: &Args, config: &BridgeConfig) -> Result<()> {
    let broker = filesystem_broker(config);
    let mode = if args.read_only {
        AccessMode::ReadOnly
    } else {
        AccessMode::ReadWrite
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = runtime.block_on(async {
        let pick = broker.pick_directory(&TerminalPicker, mode);
        match args.timeout {
            None => pick.await,
            Some(secs) => {
                tokio::pin!(pick);
                tokio::select! {
                    result = &mut pick => result,
                    () = tokio::time::sleep(Duration::from_secs(secs)) => {
                        broker.dismiss_picker();
                        pick.await
                    }
                }
            }
        }
    });
    // The stdin reader may still be blocked on a line nobody will type.
    runtime.shutdown_background();

    let picked = result?;
    let out = json!({
        "path": picked.path.display().to_string(),
        "bookmark": picked.bookmark.to_base64(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
