//! Persistent store for the catalog and its change log.
//!
//! The bridge treats durable storage as a collaborator: a [`CatalogStore`] loads the last
//! committed state and commits a catalog mutation together with its log entries as one
//! unit, so a crash never separates the two.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] keeps everything in process memory (tests, ephemeral bridges).
//! - [`JsonFileStore`] keeps a single JSON document on disk and replaces it atomically
//!   (write to a temp file in the same directory, fsync, rename).
//!
//! `JsonFileStore` rewrites and fsyncs the whole document on every commit, and the catalog
//! commits while holding its write lock. Mutation latency therefore grows with catalog size
//! and readers wait out each write. Large catalogs need an incremental store behind the same
//! trait.

use crate::cursor::ChangeEntry;
use crate::item::{ItemIdentifier, ItemMetadata};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure reading or writing the backing file.
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored document could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Stored document has an unsupported layout.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

/// Everything the store holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Schema version for future migrations
    #[serde(default = "default_version")]
    pub version: u32,
    /// Log epoch; `None` for a store that has never been written.
    #[serde(default)]
    pub epoch: Option<u32>,
    /// Highest pruned log sequence number.
    #[serde(default)]
    pub floor: u64,
    /// Items in catalog insertion order.
    #[serde(default)]
    pub items: Vec<ItemMetadata>,
    /// Retained log entries, oldest first.
    #[serde(default)]
    pub log: Vec<ChangeEntry>,
}

fn default_version() -> u32 {
    1
}

const SUPPORTED_VERSION: u32 = 1;

/// One atomic unit of catalog change.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub epoch: u32,
    pub upserts: Vec<ItemMetadata>,
    pub removals: Vec<ItemIdentifier>,
    pub entries: Vec<ChangeEntry>,
    /// Log floor after this batch; entries at or below it are dropped.
    pub floor: u64,
    /// Replace the whole log (used when the log is reset during repair).
    pub reset_log: bool,
}

/// Durable storage contract for the catalog.
pub trait CatalogStore: Send + Sync {
    /// Load the last committed state.
    fn load(&self) -> Result<StoreSnapshot, StoreError>;

    /// Commit a batch. Either every part of the batch becomes durable or none does.
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError>;
}

impl StoreSnapshot {
    /// Apply a batch in place.
    ///
    /// Items keep their position on update; an item whose parent changed moves to the end
    /// so insertion order within its new parent matches the catalog.
    pub fn apply(&mut self, batch: &CommitBatch) {
        self.epoch = Some(batch.epoch);

        for meta in &batch.upserts {
            match self.items.iter().position(|m| m.identifier == meta.identifier) {
                Some(idx) if self.items[idx].parent == meta.parent => {
                    self.items[idx] = meta.clone();
                }
                Some(idx) => {
                    self.items.remove(idx);
                    self.items.push(meta.clone());
                }
                None => self.items.push(meta.clone()),
            }
        }

        if !batch.removals.is_empty() {
            self.items
                .retain(|m| !batch.removals.iter().any(|r| r == &m.identifier));
        }

        if batch.reset_log {
            self.log.clear();
        }
        self.log.extend(batch.entries.iter().cloned());
        self.log.retain(|e| e.seq > batch.floor);
        self.floor = batch.floor;
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a pre-populated state.
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().clone()
    }
}

impl CatalogStore for MemoryStore {
    fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.state.lock().clone())
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        self.state.lock().apply(batch);
        Ok(())
    }
}

/// Single-file JSON store with atomic replacement.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreSnapshot>,
}

impl JsonFileStore {
    /// Open (or prepare to create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = Self::read(&path)?;
        debug!(
            "opened store {} ({} items, {} log entries)",
            path.display(),
            state.items.len(),
            state.log.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<StoreSnapshot, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreSnapshot::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version > SUPPORTED_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn write(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        serde_json::to_writer(&mut tmp, snapshot)?;
        tmp.flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        trace!("wrote store {}", self.path.display());
        Ok(())
    }
}

impl CatalogStore for JsonFileStore {
    fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.state.lock().clone())
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        next.apply(batch);
        // Only adopt the new state once it is durable.
        self.write(&next)?;
        *state = next;
        Ok(())
    }
}
