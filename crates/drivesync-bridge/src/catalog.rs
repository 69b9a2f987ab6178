//! Identifier and metadata catalog.
//!
//! The catalog is the single source of truth for naming and hierarchy. Every successful
//! mutation is committed to the [`CatalogStore`] together with its change log entries and
//! only then applied in memory, all under one write lock, so no reader can observe a
//! mutation without its log entry or the other way around.

use crate::cursor::{ChangeCursor, ChangeEntry, ChangeKind, ChangeLog, ChangeSlice, CursorError};
use crate::item::{ItemIdentifier, ItemKind, ItemMetadata};
use crate::store::{CatalogStore, CommitBatch, MemoryStore, StoreError};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Default number of change entries retained before pruning.
pub const DEFAULT_LOG_RETENTION: usize = 10_000;

/// Error type for catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Identifier was never issued or has been removed.
    #[error("item not found: {0}")]
    NotFound(ItemIdentifier),

    /// Children were requested from a file.
    #[error("not a container: {0}")]
    NotAContainer(ItemIdentifier),

    /// The parent of an upserted item does not exist.
    #[error("parent {parent} of {item} does not exist")]
    DanglingParent {
        item: ItemIdentifier,
        parent: ItemIdentifier,
    },

    /// The upsert would make an item its own ancestor.
    #[error("moving {item} under {parent} would create a cycle")]
    CycleDetected {
        item: ItemIdentifier,
        parent: ItemIdentifier,
    },

    /// A folder with children cannot become a file.
    #[error("cannot change kind of {0}: folder still has children")]
    KindConflict(ItemIdentifier),

    /// The identifier is reserved by the bridge.
    #[error("identifier is reserved: {0}")]
    ReservedIdentifier(ItemIdentifier),

    /// Persisting the mutation failed; nothing was applied.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cursor rejected by the change log.
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

#[derive(Debug)]
struct CatalogState {
    items: HashMap<ItemIdentifier, ItemMetadata>,
    /// Children per container in insertion order. The root's list is keyed by the root id.
    children: HashMap<ItemIdentifier, Vec<ItemIdentifier>>,
    log: ChangeLog,
}

impl CatalogState {
    fn empty(log: ChangeLog) -> Self {
        let mut children = HashMap::new();
        children.insert(ItemIdentifier::root(), Vec::new());
        Self {
            items: HashMap::new(),
            children,
            log,
        }
    }

    /// Parent chain of `id` (excluding `id`), nearest first, ending with the root.
    fn ancestors_of(&self, id: &ItemIdentifier) -> Vec<ItemIdentifier> {
        let mut chain = Vec::new();
        let mut current = self.items.get(id).map(ItemMetadata::parent_or_root);
        while let Some(parent) = current {
            if parent.is_root() {
                chain.push(parent);
                break;
            }
            current = self.items.get(&parent).map(ItemMetadata::parent_or_root);
            chain.push(parent);
        }
        chain
    }

    /// Chain for an item placed directly under `parent`.
    fn chain_under(&self, parent: &ItemIdentifier) -> Vec<ItemIdentifier> {
        let mut chain = vec![parent.clone()];
        if !parent.is_root() {
            chain.extend(self.ancestors_of(parent));
        }
        chain
    }

    /// `id` and its descendants, descendants first.
    fn subtree_post_order(&self, id: &ItemIdentifier) -> Vec<ItemIdentifier> {
        let mut out = Vec::new();
        let mut stack = vec![(id.clone(), false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                out.push(current);
                continue;
            }
            stack.push((current.clone(), true));
            if let Some(kids) = self.children.get(&current) {
                for kid in kids.iter().rev() {
                    stack.push((kid.clone(), false));
                }
            }
        }
        out
    }

    fn insert_child(&mut self, parent: &ItemIdentifier, child: &ItemIdentifier) {
        self.children
            .entry(parent.clone())
            .or_default()
            .push(child.clone());
    }

    fn remove_child(&mut self, parent: &ItemIdentifier, child: &ItemIdentifier) {
        if let Some(kids) = self.children.get_mut(parent) {
            kids.retain(|k| k != child);
        }
    }
}

/// The identifier and metadata catalog.
pub struct Catalog {
    state: RwLock<CatalogState>,
    store: Arc<dyn CatalogStore>,
    retention: usize,
}

impl Catalog {
    /// Open a catalog over `store`, repairing any inconsistency left by a previous run.
    pub fn open(store: Arc<dyn CatalogStore>, retention: usize) -> Result<Self, CatalogError> {
        let snapshot = store.load()?;
        let retention = retention.max(1);

        // A store that has never been written still persists its epoch up front, so cursors
        // handed out before the first mutation survive a restart.
        let mut reset_log = false;
        let log = match snapshot.epoch {
            None => {
                reset_log = true;
                ChangeLog::new()
            }
            Some(epoch) => {
                if let Some(log) = ChangeLog::restore(epoch, snapshot.floor, snapshot.log) {
                    log
                } else {
                    warn!("change log is not contiguous, starting a new log generation");
                    reset_log = true;
                    ChangeLog::new()
                }
            }
        };

        let mut state = CatalogState::empty(log);
        for meta in snapshot.items {
            let parent = meta.parent_or_root();
            let id = meta.identifier.clone();
            if meta.kind == ItemKind::Folder {
                state.children.entry(id.clone()).or_default();
            }
            state.items.insert(id.clone(), meta);
            state.insert_child(&parent, &id);
        }

        let catalog = Self {
            state: RwLock::new(state),
            store,
            retention,
        };
        catalog.repair(reset_log)?;

        info!(
            "catalog opened ({} items, cursor {})",
            catalog.len(),
            catalog.current_cursor()
        );
        Ok(catalog)
    }

    /// Open over a copy of `store`'s contents. Repair and later mutations stay in memory;
    /// `store` is never written.
    pub fn open_read_only(
        store: &dyn CatalogStore,
        retention: usize,
    ) -> Result<Self, CatalogError> {
        let snapshot = store.load()?;
        Self::open(Arc::new(MemoryStore::with_snapshot(snapshot)), retention)
    }

    /// Drop items whose parent chain does not reach the root through folders, and persist
    /// a fresh log generation if the old one was unusable or never written.
    fn repair(&self, reset_log: bool) -> Result<(), CatalogError> {
        let mut state = self.state.write();

        let mut valid: HashSet<ItemIdentifier> = HashSet::new();
        let mut orphans: Vec<ItemIdentifier> = Vec::new();
        for id in state.items.keys() {
            let mut seen = HashSet::new();
            let mut current = id.clone();
            let reachable = loop {
                if !seen.insert(current.clone()) {
                    break false;
                }
                let Some(meta) = state.items.get(&current) else {
                    break false;
                };
                let parent = meta.parent_or_root();
                if parent.is_root() || valid.contains(&parent) {
                    break true;
                }
                match state.items.get(&parent) {
                    Some(p) if p.kind == ItemKind::Folder => current = parent,
                    _ => break false,
                }
            };
            if reachable {
                valid.extend(seen);
            } else {
                orphans.push(id.clone());
            }
        }

        if orphans.is_empty() && !reset_log {
            return Ok(());
        }

        let mut entries = Vec::new();
        for id in &orphans {
            warn!("repairing catalog: dropping unreachable item {id}");
            entries.push(ChangeEntry {
                seq: 0,
                identifier: id.clone(),
                kind: ChangeKind::Deleted,
                metadata: None,
                ancestors: vec![ItemIdentifier::root()],
                previous_ancestors: None,
                recorded_at: Utc::now(),
            });
        }
        let entries = number_entries(&state.log, entries);
        let batch = CommitBatch {
            epoch: state.log.epoch(),
            upserts: Vec::new(),
            removals: orphans.clone(),
            floor: state.log.floor_after(entries.len(), self.retention),
            entries: entries.clone(),
            reset_log,
        };
        self.store.commit(&batch)?;

        for id in &orphans {
            if let Some(meta) = state.items.remove(id) {
                let parent = meta.parent_or_root();
                state.remove_child(&parent, id);
            }
            state.children.remove(id);
        }
        for entry in entries {
            state.log.append(entry);
        }
        state.log.prune_to(batch.floor);
        Ok(())
    }

    /// Metadata for `id`. Reserved identifiers resolve to a synthetic container record
    /// carrying the identifier asked for.
    pub fn lookup(&self, id: &ItemIdentifier) -> Result<ItemMetadata, CatalogError> {
        if id.is_reserved() {
            return Ok(ItemMetadata {
                identifier: id.clone(),
                ..ItemMetadata::root()
            });
        }
        self.state
            .read()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.clone()))
    }

    /// Child identifiers of a container, in insertion order.
    pub fn children(&self, id: &ItemIdentifier) -> Result<Vec<ItemIdentifier>, CatalogError> {
        let state = self.state.read();
        Self::children_locked(&state, id).map(<[ItemIdentifier]>::to_vec)
    }

    fn children_locked<'a>(
        state: &'a CatalogState,
        id: &ItemIdentifier,
    ) -> Result<&'a [ItemIdentifier], CatalogError> {
        let key = if id.is_reserved() {
            ItemIdentifier::root()
        } else {
            let meta = state
                .items
                .get(id)
                .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
            if meta.kind != ItemKind::Folder {
                return Err(CatalogError::NotAContainer(id.clone()));
            }
            id.clone()
        };
        Ok(state.children.get(&key).map_or(&[][..], Vec::as_slice))
    }

    /// Children metadata of a container plus the cursor at that instant, read under one
    /// lock so the pair is consistent.
    pub fn snapshot_children(
        &self,
        id: &ItemIdentifier,
    ) -> Result<(Vec<ItemMetadata>, ChangeCursor), CatalogError> {
        let state = self.state.read();
        let kids = Self::children_locked(&state, id)?;
        let items = kids
            .iter()
            .filter_map(|k| state.items.get(k).cloned())
            .collect();
        Ok((items, state.log.current()))
    }

    /// Insert or replace an item's metadata.
    ///
    /// Returns the cursor after the logged change.
    pub fn upsert(&self, mut meta: ItemMetadata) -> Result<ChangeCursor, CatalogError> {
        let id = meta.identifier.clone();
        if id.is_reserved() {
            return Err(CatalogError::ReservedIdentifier(id));
        }
        let parent = meta.parent_or_root();
        if parent.is_working_set() {
            return Err(CatalogError::ReservedIdentifier(parent));
        }
        meta.parent = Some(parent.clone());
        if meta.kind == ItemKind::Folder {
            meta.size = None;
        }

        let mut state = self.state.write();

        if !parent.is_root() {
            match state.items.get(&parent) {
                None => {
                    warn!("rejecting upsert of {id}: parent {parent} does not exist");
                    return Err(CatalogError::DanglingParent { item: id, parent });
                }
                Some(p) if p.kind != ItemKind::Folder => {
                    warn!("rejecting upsert of {id}: parent {parent} is not a folder");
                    return Err(CatalogError::NotAContainer(parent));
                }
                Some(_) => {}
            }
        }

        let existing = state.items.get(&id).cloned();
        if existing.as_ref() == Some(&meta) {
            trace!("upsert of {id} is a no-op");
            return Ok(state.log.current());
        }

        let moved = existing
            .as_ref()
            .is_some_and(|old| old.parent_or_root() != parent);

        if moved && (parent == id || state.ancestors_of(&parent).contains(&id)) {
            warn!("rejecting move of {id} under {parent}: cycle");
            return Err(CatalogError::CycleDetected { item: id, parent });
        }

        if let Some(old) = &existing
            && old.kind == ItemKind::Folder
            && meta.kind != ItemKind::Folder
            && state.children.get(&id).is_some_and(|kids| !kids.is_empty())
        {
            return Err(CatalogError::KindConflict(id));
        }

        let entry = ChangeEntry {
            seq: 0,
            identifier: id.clone(),
            kind: if existing.is_some() {
                ChangeKind::Updated
            } else {
                ChangeKind::Created
            },
            metadata: Some(meta.clone()),
            ancestors: state.chain_under(&parent),
            previous_ancestors: moved.then(|| state.ancestors_of(&id)),
            recorded_at: Utc::now(),
        };
        let entries = number_entries(&state.log, vec![entry]);
        let batch = CommitBatch {
            epoch: state.log.epoch(),
            upserts: vec![meta.clone()],
            removals: Vec::new(),
            floor: state.log.floor_after(1, self.retention),
            entries: entries.clone(),
            reset_log: false,
        };
        self.store.commit(&batch)?;

        // Durable; apply in memory.
        match &existing {
            None => state.insert_child(&parent, &id),
            Some(old) if moved => {
                let old_parent = old.parent_or_root();
                state.remove_child(&old_parent, &id);
                state.insert_child(&parent, &id);
            }
            Some(_) => {}
        }
        if meta.kind == ItemKind::Folder {
            state.children.entry(id.clone()).or_default();
        } else {
            state.children.remove(&id);
        }
        state.items.insert(id.clone(), meta);
        let mut cursor = state.log.current();
        for entry in entries {
            cursor = state.log.append(entry);
        }
        state.log.prune_to(batch.floor);

        debug!(
            "upsert {id} ({}) -> {cursor}",
            if existing.is_some() { "updated" } else { "created" }
        );
        Ok(cursor)
    }

    /// Remove an item. Removing a folder removes its whole subtree, logging one deletion
    /// per item, descendants first.
    pub fn remove(&self, id: &ItemIdentifier) -> Result<ChangeCursor, CatalogError> {
        if id.is_reserved() {
            return Err(CatalogError::ReservedIdentifier(id.clone()));
        }

        let mut state = self.state.write();
        if !state.items.contains_key(id) {
            return Err(CatalogError::NotFound(id.clone()));
        }

        let doomed = state.subtree_post_order(id);
        let now = Utc::now();
        let entries: Vec<ChangeEntry> = doomed
            .iter()
            .map(|d| ChangeEntry {
                seq: 0,
                identifier: d.clone(),
                kind: ChangeKind::Deleted,
                metadata: None,
                ancestors: state.ancestors_of(d),
                previous_ancestors: None,
                recorded_at: now,
            })
            .collect();
        let entries = number_entries(&state.log, entries);
        let batch = CommitBatch {
            epoch: state.log.epoch(),
            upserts: Vec::new(),
            removals: doomed.clone(),
            floor: state.log.floor_after(entries.len(), self.retention),
            entries: entries.clone(),
            reset_log: false,
        };
        self.store.commit(&batch)?;

        for d in &doomed {
            if let Some(meta) = state.items.remove(d) {
                let parent = meta.parent_or_root();
                state.remove_child(&parent, d);
            }
            state.children.remove(d);
        }
        let mut cursor = state.log.current();
        for entry in entries {
            cursor = state.log.append(entry);
        }
        state.log.prune_to(batch.floor);

        debug!("remove {id} ({} items) -> {cursor}", doomed.len());
        Ok(cursor)
    }

    /// Log entries strictly after `cursor`, at most `limit`.
    pub fn changes_since(
        &self,
        cursor: &ChangeCursor,
        limit: usize,
    ) -> Result<ChangeSlice, CatalogError> {
        Ok(self.state.read().log.since_limited(cursor, limit)?)
    }

    /// Cursor positioned after the newest change.
    pub fn current_cursor(&self) -> ChangeCursor {
        self.state.read().log.current()
    }

    /// Number of items, excluding the root.
    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Assign the sequence numbers the log will give `entries` when appended.
fn number_entries(log: &ChangeLog, mut entries: Vec<ChangeEntry>) -> Vec<ChangeEntry> {
    let mut seq = log.next_seq();
    for entry in &mut entries {
        entry.seq = seq;
        seq += 1;
    }
    entries
}
