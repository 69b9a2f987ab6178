//! Placeholder and content materializer.
//!
//! Placeholders are rendered straight from the catalog on every call. Content is fetched
//! from the sync engine into a temp file inside the content directory and renamed into
//! place only once complete, so an abandoned or failed transfer leaves nothing behind.
//!
//! Each identifier owns one location under the content directory: the base64url form of
//! the identifier, split into nested segments when it is too long for one file name. The
//! mapping is invertible, so a location found on disk can be traced back to its item and
//! copies whose item has left the catalog can be swept away, including those written by an
//! earlier process.

use crate::catalog::{Catalog, CatalogError};
use crate::engine::{SyncEngine, SyncError};
use crate::item::{Capabilities, ItemIdentifier, ItemKind, ItemMetadata};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Default number of extra attempts for a failed fetch.
pub const DEFAULT_FETCH_RETRIES: u32 = 3;

/// Default base backoff between fetch attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Longest wait between two fetch attempts.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

/// Longest file name segment of a content location.
const SEGMENT_LEN: usize = 200;

/// Suffix of every segment but the last. Not in the base64url alphabet.
const SEGMENT_MARK: char = '~';

/// Error type for materializer operations.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("item not found: {0}")]
    NotFound(ItemIdentifier),

    /// Content was requested for a folder.
    #[error("not a file: {0}")]
    NotAFile(ItemIdentifier),

    /// Every fetch attempt failed.
    #[error("transfer of {identifier} failed after {attempts} attempts: {reason}")]
    TransferFailed {
        identifier: ItemIdentifier,
        attempts: u32,
        reason: String,
    },

    /// The caller abandoned the transfer.
    #[error("materialization of {0} cancelled")]
    Cancelled(ItemIdentifier),

    /// Local content directory failure.
    #[error("content I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Catalog(CatalogError),
}

impl From<CatalogError> for MaterializeError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(id) => MaterializeError::NotFound(id),
            other => MaterializeError::Catalog(other),
        }
    }
}

/// What the host needs to render an entry without its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderDescriptor {
    pub identifier: ItemIdentifier,
    pub parent: Option<ItemIdentifier>,
    pub filename: String,
    pub kind: ItemKind,
    pub size: Option<u64>,
    pub content_type: String,
    pub modified: DateTime<Utc>,
    pub capabilities: Capabilities,
    /// A current local copy exists.
    pub materialized: bool,
}

/// A locally available copy of an item's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedFile {
    pub identifier: ItemIdentifier,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl MaterializedFile {
    /// Open the content for reading.
    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

/// Why one attempt failed.
enum AttemptError {
    Sync(SyncError),
    Io(std::io::Error),
    SizeMismatch { expected: u64, actual: u64 },
}

impl AttemptError {
    fn retryable(&self) -> bool {
        !matches!(self, AttemptError::Sync(SyncError::NotFound(_)))
    }

    fn reason(&self) -> String {
        match self {
            AttemptError::Sync(e) => e.to_string(),
            AttemptError::Io(e) => e.to_string(),
            AttemptError::SizeMismatch { expected, actual } => {
                format!("expected {expected} bytes, received {actual}")
            }
        }
    }
}

/// The placeholder and content materializer.
pub struct Materializer {
    catalog: Arc<Catalog>,
    engine: Arc<dyn SyncEngine>,
    content_dir: PathBuf,
    fetch_retries: u32,
    retry_backoff: Duration,
    /// Per-identifier serialization of transfers and evictions.
    locks: DashMap<ItemIdentifier, Arc<Mutex<()>>>,
    /// Metadata each local copy was fetched for.
    local: DashMap<ItemIdentifier, MaterializedFile>,
}

impl Materializer {
    pub fn new(
        catalog: Arc<Catalog>,
        engine: Arc<dyn SyncEngine>,
        content_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::with_retry(
            catalog,
            engine,
            content_dir,
            DEFAULT_FETCH_RETRIES,
            DEFAULT_RETRY_BACKOFF,
        )
    }

    pub fn with_retry(
        catalog: Arc<Catalog>,
        engine: Arc<dyn SyncEngine>,
        content_dir: impl Into<PathBuf>,
        fetch_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            catalog,
            engine,
            content_dir: content_dir.into(),
            fetch_retries,
            retry_backoff,
            locks: DashMap::new(),
            local: DashMap::new(),
        }
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    /// Render a placeholder from the catalog's current metadata.
    pub fn placeholder(&self, id: &ItemIdentifier) -> Result<PlaceholderDescriptor, MaterializeError> {
        debug!("placeholder: {}", id);
        let meta = self.catalog.lookup(id)?;
        let materialized = self.is_current(&meta);
        Ok(PlaceholderDescriptor {
            identifier: meta.identifier,
            parent: meta.parent,
            filename: meta.filename,
            kind: meta.kind,
            size: meta.size,
            content_type: meta.content_type,
            modified: meta.modified,
            capabilities: meta.capabilities,
            materialized,
        })
    }

    /// Whether a local copy matching the current metadata exists.
    pub fn is_materialized(&self, id: &ItemIdentifier) -> bool {
        self.catalog
            .lookup(id)
            .is_ok_and(|meta| self.is_current(&meta))
    }

    fn is_current(&self, meta: &ItemMetadata) -> bool {
        self.local.get(&meta.identifier).is_some_and(|copy| {
            Some(copy.size) == meta.size && copy.modified == meta.modified && copy.path.is_file()
        })
    }

    /// Path a materialized copy of `id` lives at.
    pub fn content_path(&self, id: &ItemIdentifier) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(id.as_str());
        let mut path = self.content_dir.clone();
        let mut rest = encoded.as_str();
        while rest.len() > SEGMENT_LEN {
            let (head, tail) = rest.split_at(SEGMENT_LEN);
            path.push(format!("{head}{SEGMENT_MARK}"));
            rest = tail;
        }
        path.push(rest);
        path
    }

    /// Location of a cataloged file item's content, whether or not it is materialized.
    pub fn location_for(&self, id: &ItemIdentifier) -> Result<PathBuf, MaterializeError> {
        let meta = self.catalog.lookup(id)?;
        if meta.is_folder() {
            return Err(MaterializeError::NotAFile(id.clone()));
        }
        Ok(self.content_path(id))
    }

    /// The identifier whose content lives at `path`, if `path` is a content location.
    pub fn identifier_for_path(&self, path: &Path) -> Option<ItemIdentifier> {
        let relative = path.strip_prefix(&self.content_dir).ok()?;
        let mut encoded = String::new();
        for component in relative.components() {
            let Component::Normal(name) = component else {
                return None;
            };
            let name = name.to_str()?;
            encoded.push_str(name.strip_suffix(SEGMENT_MARK).unwrap_or(name));
        }
        if encoded.is_empty() {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let id = ItemIdentifier::new(String::from_utf8(bytes).ok()?);
        // Only the canonical split maps back.
        (self.content_path(&id) == path).then_some(id)
    }

    /// Identifiers with a content file on disk, tracked or not.
    fn stored_identifiers(&self) -> Vec<ItemIdentifier> {
        WalkDir::new(&self.content_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| self.identifier_for_path(entry.path()))
            .collect()
    }

    fn lock_for(&self, id: &ItemIdentifier) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.clone()).or_default().value())
    }

    fn release_lock(&self, id: &ItemIdentifier) {
        // Ours plus the map's.
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    /// Fetch `id`'s content and make it locally available.
    ///
    /// Cancelling `cancel` abandons the transfer; the catalog and any previous local copy
    /// are left as they were.
    pub async fn materialize(
        &self,
        id: &ItemIdentifier,
        cancel: &CancellationToken,
    ) -> Result<MaterializedFile, MaterializeError> {
        debug!("materialize: {}", id);

        let lock = self.lock_for(id);
        let result = tokio::select! {
            () = cancel.cancelled() => Err(MaterializeError::Cancelled(id.clone())),
            guard = lock.lock() => {
                let r = self.materialize_locked(id, cancel).await;
                drop(guard);
                r
            }
        };
        drop(lock);
        self.release_lock(id);
        result
    }

    async fn materialize_locked(
        &self,
        id: &ItemIdentifier,
        cancel: &CancellationToken,
    ) -> Result<MaterializedFile, MaterializeError> {
        let meta = self.catalog.lookup(id)?;
        if meta.is_folder() {
            return Err(MaterializeError::NotAFile(id.clone()));
        }
        if self.is_current(&meta)
            && let Some(copy) = self.local.get(id)
        {
            trace!("materialize: reusing local copy of {}", id);
            return Ok(copy.clone());
        }

        tokio::fs::create_dir_all(&self.content_dir)
            .await
            .map_err(|source| MaterializeError::Io {
                path: self.content_dir.clone(),
                source,
            })?;

        let attempts = self.fetch_retries.saturating_add(1);
        let mut attempt = 0;
        let (tmp, meta) = loop {
            attempt += 1;
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(MaterializeError::Cancelled(id.clone())),
                r = self.fetch_once(&meta) => r,
            };
            let err = match outcome {
                Ok(done) => break done,
                Err(e) => e,
            };
            if !err.retryable() {
                return Err(MaterializeError::NotFound(id.clone()));
            }
            if attempt >= attempts {
                warn!("materialize: giving up on {} after {} attempts", id, attempt);
                return Err(MaterializeError::TransferFailed {
                    identifier: id.clone(),
                    attempts: attempt,
                    reason: err.reason(),
                });
            }
            let backoff = backoff_for(self.retry_backoff, attempt);
            warn!(
                "materialize: attempt {} for {} failed ({}), retrying in {:?}",
                attempt,
                id,
                err.reason(),
                backoff
            );
            tokio::select! {
                () = cancel.cancelled() => return Err(MaterializeError::Cancelled(id.clone())),
                () = tokio::time::sleep(backoff) => {}
            }
        };

        if cancel.is_cancelled() {
            return Err(MaterializeError::Cancelled(id.clone()));
        }

        let path = self.content_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| MaterializeError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tmp.persist(&path).map_err(|e| MaterializeError::Io {
            path: path.clone(),
            source: e.error,
        })?;

        let copy = MaterializedFile {
            identifier: id.clone(),
            path,
            size: meta.size.unwrap_or_default(),
            modified: meta.modified,
        };
        self.local.insert(id.clone(), copy.clone());
        trace!("materialize: {} ready at {}", id, copy.path.display());
        Ok(copy)
    }

    /// One transfer attempt. Returns the completed temp file and the metadata it matches.
    async fn fetch_once(
        &self,
        meta: &ItemMetadata,
    ) -> Result<(tempfile::NamedTempFile, ItemMetadata), AttemptError> {
        let id = &meta.identifier;
        let mut stream = self
            .engine
            .fetch_content(id)
            .await
            .map_err(AttemptError::Sync)?;

        let tmp = tempfile::NamedTempFile::new_in(&self.content_dir).map_err(AttemptError::Io)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen().map_err(AttemptError::Io)?);
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(AttemptError::Sync)?;
            file.write_all(&chunk).await.map_err(AttemptError::Io)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(AttemptError::Io)?;
        file.sync_all().await.map_err(AttemptError::Io)?;
        trace!("fetch: {} bytes for {}", written, id);

        if meta.size == Some(written) {
            return Ok((tmp, meta.clone()));
        }

        // The catalog may be behind the engine; refresh before calling it a failure.
        let fresh = self
            .engine
            .fetch_metadata(id)
            .await
            .map_err(AttemptError::Sync)?;
        if fresh.size != Some(written) {
            return Err(AttemptError::SizeMismatch {
                expected: fresh.size.unwrap_or_default(),
                actual: written,
            });
        }
        debug!("fetch: refreshing stale metadata for {}", id);
        let fresh = ItemMetadata {
            parent: fresh.parent.or_else(|| meta.parent.clone()),
            ..fresh
        };
        if let Err(e) = self.catalog.upsert(fresh.clone()) {
            warn!("fetch: could not refresh metadata for {}: {}", id, e);
            return Err(AttemptError::SizeMismatch {
                expected: meta.size.unwrap_or_default(),
                actual: written,
            });
        }
        Ok((tmp, fresh))
    }

    /// Release the local copy of `id`. Returns whether one existed.
    pub async fn evict(&self, id: &ItemIdentifier) -> Result<bool, MaterializeError> {
        debug!("evict: {}", id);
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.local.remove(id);
            self.remove_copy(id)
        };
        drop(lock);
        self.release_lock(id);
        result
    }

    /// Delete `id`'s content file and any segment directories it leaves empty. The caller
    /// holds `id`'s lock.
    fn remove_copy(&self, id: &ItemIdentifier) -> Result<bool, MaterializeError> {
        let path = self.content_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(MaterializeError::Io { path, source }),
        }
        let mut dir = path.parent();
        while let Some(d) = dir.filter(|d| *d != self.content_dir) {
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(true)
    }

    /// Release every local copy, including ones an earlier process left on disk. Returns
    /// how many were removed.
    pub async fn evict_all(&self) -> Result<usize, MaterializeError> {
        debug!("evict_all");
        let mut ids: Vec<ItemIdentifier> = self.local.iter().map(|e| e.key().clone()).collect();
        for id in self.stored_identifiers() {
            if !self.local.contains_key(&id) {
                ids.push(id);
            }
        }
        let mut removed = 0;
        for id in ids {
            if self.evict(&id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete content files whose item is no longer a file in the catalog. Items with a
    /// transfer or eviction in flight are left for their owner. Returns how many were
    /// removed.
    pub fn sweep(&self) -> Result<usize, MaterializeError> {
        let mut removed = 0;
        for id in self.stored_identifiers() {
            if self.catalog.lookup(&id).is_ok_and(|meta| !meta.is_folder()) {
                continue;
            }
            let lock = self.lock_for(&id);
            let outcome = match lock.try_lock() {
                Ok(_guard) => {
                    self.local.remove(&id);
                    self.remove_copy(&id)
                }
                Err(_) => Ok(false),
            };
            drop(lock);
            self.release_lock(&id);
            if outcome? {
                trace!("sweep: removed orphaned copy of {}", id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("swept {} orphaned content file(s)", removed);
        }
        Ok(removed)
    }
}

/// Wait before the attempt after `attempt`: the base doubled per failure, capped.
fn backoff_for(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.checked_mul(factor)
        .map_or(MAX_RETRY_BACKOFF, |d| d.min(MAX_RETRY_BACKOFF))
}
