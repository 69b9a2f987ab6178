//! Enumeration service: full listings and change replay for one container.
//!
//! A full listing snapshots the container's children when the first page is requested and
//! serves every later page from that snapshot, so a listing is consistent even if the
//! catalog changes mid-way. Snapshots live in a Moka cache with an idle TTL; a page token
//! whose snapshot has been evicted fails with [`EnumerationError::PageExpired`].
//!
//! Change replay reads the catalog's change log after a cursor and keeps only the entries
//! that concern the enumerated container's subtree.

use crate::catalog::{Catalog, CatalogError};
use crate::cursor::{ChangeCursor, ChangeKind, CursorError};
use crate::item::{ItemIdentifier, ItemMetadata};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Default page size for enumeration (number of items per page).
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default number of change log entries read per replay batch.
pub const DEFAULT_CHANGE_BATCH_SIZE: usize = 500;

/// Default idle lifetime of a listing snapshot.
pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(300);

const MAX_LIVE_LISTINGS: u64 = 1024;

/// Error type for enumeration.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The listing this page belongs to is gone; restart the listing.
    #[error("page expired")]
    PageExpired,

    /// The page token is malformed or belongs to another container.
    #[error("invalid page token: {0}")]
    InvalidPage(String),
}

impl EnumerationError {
    /// Whether the consumer should fall back to a full listing.
    pub fn requires_full_listing(&self) -> bool {
        matches!(
            self,
            EnumerationError::PageExpired
                | EnumerationError::Catalog(CatalogError::Cursor(CursorError::Expired { .. }))
        )
    }
}

/// Opaque continuation token for a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken {
    listing: u64,
    offset: u32,
}

const PAGE_TOKEN_LEN: usize = 12;

impl PageToken {
    pub fn encode(&self) -> String {
        let mut bytes = [0u8; PAGE_TOKEN_LEN];
        bytes[..8].copy_from_slice(&self.listing.to_be_bytes());
        bytes[8..].copy_from_slice(&self.offset.to_be_bytes());
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn decode(s: &str) -> Result<Self, EnumerationError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| EnumerationError::InvalidPage(e.to_string()))?;
        let bytes: [u8; PAGE_TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| EnumerationError::InvalidPage(format!("{s}: wrong length")))?;
        let mut listing = [0u8; 8];
        listing.copy_from_slice(&bytes[..8]);
        let mut offset = [0u8; 4];
        offset.copy_from_slice(&bytes[8..]);
        Ok(Self {
            listing: u64::from_be_bytes(listing),
            offset: u32::from_be_bytes(offset),
        })
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// One page of a full listing.
#[derive(Debug, Clone)]
pub struct ListingPage {
    pub items: Vec<ItemMetadata>,
    /// `None` once the listing is exhausted.
    pub next_page: Option<PageToken>,
    /// Cursor captured with the snapshot; replaying from it yields every change made after
    /// the listing started.
    pub cursor: ChangeCursor,
}

impl ListingPage {
    pub fn is_last(&self) -> bool {
        self.next_page.is_none()
    }
}

/// One replayed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "lowercase")]
pub enum Change {
    Created(ItemMetadata),
    Updated(ItemMetadata),
    Deleted { identifier: ItemIdentifier },
}

impl Change {
    pub fn identifier(&self) -> &ItemIdentifier {
        match self {
            Change::Created(meta) | Change::Updated(meta) => &meta.identifier,
            Change::Deleted { identifier } => identifier,
        }
    }
}

/// Result of a change replay.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    pub next_cursor: ChangeCursor,
    /// More entries are available right now; `false` once caught up.
    pub more_coming: bool,
}

#[derive(Debug)]
struct ListingSnapshot {
    container: ItemIdentifier,
    items: Vec<ItemMetadata>,
    cursor: ChangeCursor,
}

/// The enumeration service.
pub struct Enumerator {
    catalog: Arc<Catalog>,
    listings: Cache<u64, Arc<ListingSnapshot>>,
    next_listing: AtomicU64,
    page_size: usize,
    batch_size: usize,
}

impl Enumerator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_limits(
            catalog,
            DEFAULT_PAGE_SIZE,
            DEFAULT_CHANGE_BATCH_SIZE,
            DEFAULT_LISTING_TTL,
        )
    }

    pub fn with_limits(
        catalog: Arc<Catalog>,
        page_size: usize,
        batch_size: usize,
        listing_ttl: Duration,
    ) -> Self {
        Self {
            catalog,
            listings: Cache::builder()
                .max_capacity(MAX_LIVE_LISTINGS)
                .time_to_idle(listing_ttl)
                .build(),
            next_listing: AtomicU64::new(1),
            page_size: page_size.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// List a container. Pass `None` to start a listing, then each returned `next_page`.
    pub fn list(
        &self,
        container: &ItemIdentifier,
        page: Option<&PageToken>,
    ) -> Result<ListingPage, EnumerationError> {
        debug!("list: {} (page={:?})", container, page.map(PageToken::encode));

        let (listing_id, snapshot, offset) = match page {
            None => {
                let (items, cursor) = self.catalog.snapshot_children(container)?;
                let id = self.next_listing.fetch_add(1, Ordering::Relaxed);
                let snapshot = Arc::new(ListingSnapshot {
                    container: container.clone(),
                    items,
                    cursor,
                });
                (id, snapshot, 0usize)
            }
            Some(token) => {
                let snapshot = self
                    .listings
                    .get(&token.listing)
                    .ok_or(EnumerationError::PageExpired)?;
                if &snapshot.container != container {
                    return Err(EnumerationError::InvalidPage(format!(
                        "page belongs to {}, not {container}",
                        snapshot.container
                    )));
                }
                (token.listing, snapshot, token.offset as usize)
            }
        };

        let total = snapshot.items.len();
        let start = offset.min(total);
        let end = (start + self.page_size).min(total);
        let items = snapshot.items[start..end].to_vec();

        let next_page = if end < total {
            self.listings.insert(listing_id, Arc::clone(&snapshot));
            Some(PageToken {
                listing: listing_id,
                offset: u32::try_from(end)
                    .map_err(|_| EnumerationError::InvalidPage("listing too large".into()))?,
            })
        } else {
            self.listings.invalidate(&listing_id);
            None
        };

        trace!(
            "list: returning {} items, has_more={}",
            items.len(),
            next_page.is_some()
        );

        Ok(ListingPage {
            items,
            next_page,
            cursor: snapshot.cursor,
        })
    }

    /// Replay changes under `container` after `cursor`.
    pub fn changes(
        &self,
        container: &ItemIdentifier,
        cursor: &ChangeCursor,
    ) -> Result<ChangeBatch, EnumerationError> {
        debug!("changes: {} since {}", container, cursor);

        if !container.is_reserved() {
            let meta = self.catalog.lookup(container)?;
            if !meta.is_folder() {
                return Err(CatalogError::NotAContainer(container.clone()).into());
            }
        }

        let slice = self.catalog.changes_since(cursor, self.batch_size)?;
        let whole_tree = container.is_reserved();

        let mut changes = Vec::new();
        for entry in slice.entries {
            if &entry.identifier == container {
                continue;
            }
            let now_under = whole_tree || entry.is_under(container);
            let was_under = !whole_tree && entry.was_under(container);

            let change = match (entry.kind, entry.metadata) {
                (ChangeKind::Deleted, _) if now_under => Change::Deleted {
                    identifier: entry.identifier,
                },
                (ChangeKind::Created, Some(meta)) if now_under => Change::Created(meta),
                (ChangeKind::Updated, Some(meta)) if now_under => {
                    if entry.previous_ancestors.is_some() && !whole_tree && !was_under {
                        // Moved in from outside this container.
                        Change::Created(meta)
                    } else {
                        Change::Updated(meta)
                    }
                }
                (ChangeKind::Updated, _) if was_under => Change::Deleted {
                    identifier: entry.identifier,
                },
                _ => continue,
            };
            changes.push(change);
        }

        trace!(
            "changes: {} in scope, next={}, more={}",
            changes.len(),
            slice.next_cursor,
            slice.more
        );

        Ok(ChangeBatch {
            changes,
            next_cursor: slice.next_cursor,
            more_coming: slice.more,
        })
    }

    /// Cursor after the newest change.
    pub fn current_cursor(&self) -> ChangeCursor {
        self.catalog.current_cursor()
    }
}
