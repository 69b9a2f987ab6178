//! Catalog command - inspect a persisted catalog store.
//!
//! # Examples
//!
//! ```bash
//! # List the root container
//! drivesync catalog ls ~/.local/share/drivesync/catalog.json
//!
//! # List a folder as JSON
//! drivesync catalog ls catalog.json f3a1 --json
//!
//! # Replay everything after a cursor
//! drivesync catalog changes catalog.json --since AAAAAQAAAAAAAAAB
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Subcommand};
use drivesync_bridge::{
    BridgeConfig, Catalog, Change, ChangeCursor, Enumerator, ItemIdentifier,
    ItemMetadata, JsonFileStore,
};
use serde::Serialize;
use tracing::instrument;

use crate::output::{create_table, format_kind, format_size};

#[derive(ClapArgs, Clone)]
pub struct Args {
    #[command(subcommand)]
    pub command: CatalogCommand,
}

#[derive(Subcommand, Clone)]
pub enum CatalogCommand {
    /// List a container's children
    Ls {
        /// Catalog store file
        store: PathBuf,

        /// Container identifier (defaults to the root)
        container: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay changes recorded after a cursor
    Changes {
        /// Catalog store file
        store: PathBuf,

        /// Cursor from a previous listing or replay (defaults to the beginning)
        #[arg(long)]
        since: Option<String>,

        /// Only report changes under this container (defaults to the whole tree)
        #[arg(long)]
        container: Option<String>,
    },
}

/// JSON output format for ls
#[derive(Serialize)]
struct Listing {
    container: String,
    items: Vec<ItemMetadata>,
    cursor: ChangeCursor,
}

/// JSON output format for changes
#[derive(Serialize)]
struct Replay {
    changes: Vec<Change>,
    cursor: ChangeCursor,
}

#[instrument(level = "info", name = "cmd::catalog", skip_all)]
pub fn execute(args: &Args, config: &BridgeConfig) -> Result<()> {
    match &args.command {
        CatalogCommand::Ls {
            store,
            container,
            json,
        } => {
            let enumerator = open(store, config)?;
            let container = container
                .as_deref()
                .map_or_else(ItemIdentifier::root, ItemIdentifier::new);
            list(&enumerator, &container, *json)
        }
        CatalogCommand::Changes {
            store,
            since,
            container,
        } => {
            let enumerator = open(store, config)?;
            let container = container
                .as_deref()
                .map_or_else(ItemIdentifier::working_set, ItemIdentifier::new);
            let since = match since {
                Some(s) => s.parse::<ChangeCursor>()?,
                None => ChangeCursor::ORIGIN,
            };
            replay(&enumerator, &container, since)
        }
    }
}

fn open(store: &Path, config: &BridgeConfig) -> Result<Enumerator> {
    // Inspection never creates or rewrites a store.
    std::fs::metadata(store)
        .with_context(|| format!("Catalog store not found: {}", store.display()))?;
    let store = JsonFileStore::open(store)?;
    let catalog = Arc::new(Catalog::open_read_only(&store, config.log_retention)?);
    Ok(Enumerator::with_limits(
        catalog,
        config.page_size,
        config.change_batch_size,
        config.listing_ttl,
    ))
}

fn list(enumerator: &Enumerator, container: &ItemIdentifier, json: bool) -> Result<()> {
    let mut page = enumerator.list(container, None)?;
    let cursor = page.cursor;
    let mut items = std::mem::take(&mut page.items);
    while let Some(next) = page.next_page {
        page = enumerator.list(container, Some(&next))?;
        items.append(&mut page.items);
    }

    if json {
        let out = Listing {
            container: container.to_string(),
            items,
            cursor,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = create_table();
    table.set_header(vec!["", "Name", "Identifier", "Size", "Modified"]);
    for item in &items {
        table.add_row(vec![
            format_kind(item.kind).to_string(),
            item.filename.clone(),
            item.identifier.to_string(),
            item.size.map(format_size).unwrap_or_default(),
            item.modified.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    println!("{table}");
    eprintln!("cursor: {cursor}");
    Ok(())
}

fn replay(enumerator: &Enumerator, container: &ItemIdentifier, since: ChangeCursor) -> Result<()> {
    let mut cursor = since;
    let mut changes = Vec::new();
    loop {
        let batch = match enumerator.changes(container, &cursor) {
            Ok(batch) => batch,
            Err(e) if e.requires_full_listing() => {
                return Err(e).context("Cursor is too old; list the container again");
            }
            Err(e) => return Err(e.into()),
        };
        changes.extend(batch.changes);
        cursor = batch.next_cursor;
        if !batch.more_coming {
            break;
        }
    }

    let out = Replay { changes, cursor };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
