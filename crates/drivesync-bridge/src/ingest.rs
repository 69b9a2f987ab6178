//! Pulls upstream mutations from the sync engine into the catalog.
//!
//! When a materializer is attached, items that leave the catalog also give up their local
//! copies.

use crate::catalog::{Catalog, CatalogError};
use crate::engine::{Mutation, RemoteCursor, SyncEngine, SyncError};
use crate::item::ItemIdentifier;
use crate::materializer::Materializer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default period of the ingest loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Error type for an ingest pass. The remote cursor is not advanced.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Outcome of one ingest pass.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Mutations applied to the catalog.
    pub applied: usize,
    /// Mutations the catalog refused, with the reason.
    pub rejected: Vec<(ItemIdentifier, CatalogError)>,
}

/// Applies the sync engine's mutation feed to the catalog.
pub struct Ingestor {
    catalog: Arc<Catalog>,
    engine: Arc<dyn SyncEngine>,
    materializer: Option<Arc<Materializer>>,
    remote_cursor: Mutex<Option<RemoteCursor>>,
    poll_interval: Duration,
}

impl Ingestor {
    pub fn new(catalog: Arc<Catalog>, engine: Arc<dyn SyncEngine>, poll_interval: Duration) -> Self {
        Self {
            catalog,
            engine,
            materializer: None,
            remote_cursor: Mutex::new(None),
            poll_interval,
        }
    }

    /// Evict local copies of items this ingestor removes.
    #[must_use]
    pub fn with_materializer(mut self, materializer: Arc<Materializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Position in the engine's feed after the last completed pass.
    pub async fn remote_cursor(&self) -> Option<RemoteCursor> {
        self.remote_cursor.lock().await.clone()
    }

    /// Poll once and apply every mutation in order.
    ///
    /// Mutations the catalog rejects as inconsistent are skipped and reported; a store or
    /// engine failure aborts the pass so it is retried from the same remote cursor.
    pub async fn sync_once(&self) -> Result<IngestReport, IngestError> {
        let mut cursor = self.remote_cursor.lock().await;
        debug!("sync_once: since {:?}", cursor.as_ref().map(|c| c.0.as_str()));

        let batch = self.engine.poll_mutations(cursor.as_ref()).await?;
        let mut report = IngestReport::default();

        for mutation in batch.mutations {
            let id = mutation.identifier().clone();
            match self.apply(mutation).await {
                Ok(true) => report.applied += 1,
                Ok(false) => {}
                Err(IngestError::Catalog(e)) if !matches!(e, CatalogError::Store(_)) => {
                    warn!("sync_once: rejected mutation for {}: {}", id, e);
                    report.rejected.push((id, e));
                }
                Err(e) => return Err(e),
            }
        }

        *cursor = Some(batch.cursor);
        if report.applied > 0 || !report.rejected.is_empty() {
            info!(
                "ingested {} mutation(s), rejected {}",
                report.applied,
                report.rejected.len()
            );
        }
        Ok(report)
    }

    /// Apply one mutation. `Ok(false)` means there was nothing to do.
    async fn apply(&self, mutation: Mutation) -> Result<bool, IngestError> {
        match mutation {
            Mutation::Upsert(meta) => Ok(self.catalog.upsert(meta).map(|_| true)?),
            Mutation::Touched(id) => match self.engine.fetch_metadata(&id).await {
                Ok(meta) => Ok(self.catalog.upsert(meta).map(|_| true)?),
                Err(SyncError::NotFound(_)) => Ok(self.remove(&id).await?),
                Err(e) => Err(e.into()),
            },
            Mutation::Remove(id) => Ok(self.remove(&id).await?),
        }
    }

    async fn remove(&self, id: &ItemIdentifier) -> Result<bool, CatalogError> {
        let subtree = self.subtree(id);
        match self.catalog.remove(id) {
            Ok(_) => {}
            Err(CatalogError::NotFound(_)) => {
                trace!("sync_once: {} already gone", id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        if let Some(materializer) = &self.materializer {
            for gone in &subtree {
                // The catalog is already consistent; a copy left behind is swept later.
                if let Err(e) = materializer.evict(gone).await {
                    warn!("sync_once: could not evict {}: {}", gone, e);
                }
            }
        }
        Ok(true)
    }

    /// `id` and everything beneath it.
    fn subtree(&self, id: &ItemIdentifier) -> Vec<ItemIdentifier> {
        let mut found = vec![id.clone()];
        let mut next = 0;
        while next < found.len() {
            if let Ok(children) = self.catalog.children(&found[next]) {
                found.extend(children);
            }
            next += 1;
        }
        found
    }

    /// Run [`sync_once`](Self::sync_once) every poll interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("starting ingest loop (poll interval: {:?})", self.poll_interval);
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.sync_once().await {
                warn!("ingest pass failed: {}", e);
            }
        }
        info!("ingest loop stopped");
    }
}
