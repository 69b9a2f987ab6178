//! Component assembly.

use crate::broker::{FolderPicker, FsScopeProvider, ScopeProvider, ScopedAccessBroker};
use crate::catalog::Catalog;
use crate::channel::BookmarkChannel;
use crate::config::BridgeConfig;
use crate::engine::SyncEngine;
use crate::enumeration::Enumerator;
use crate::error::BridgeError;
use crate::ingest::Ingestor;
use crate::materializer::Materializer;
use crate::store::{CatalogStore, JsonFileStore, MemoryStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Every bridge component wired to one catalog, one engine and one broker.
pub struct DriveBridge {
    config: BridgeConfig,
    catalog: Arc<Catalog>,
    enumerator: Enumerator,
    materializer: Arc<Materializer>,
    ingestor: Arc<Ingestor>,
    broker: Arc<ScopedAccessBroker>,
}

impl DriveBridge {
    /// Open a bridge using the store named by the config (in-memory when unset) and the
    /// filesystem scope provider.
    pub fn open(config: BridgeConfig, engine: Arc<dyn SyncEngine>) -> Result<Self, BridgeError> {
        let store: Arc<dyn CatalogStore> = match &config.store_path {
            Some(path) => Arc::new(JsonFileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_parts(config, store, engine, Arc::new(FsScopeProvider))
    }

    pub fn with_parts(
        config: BridgeConfig,
        store: Arc<dyn CatalogStore>,
        engine: Arc<dyn SyncEngine>,
        scopes: Arc<dyn ScopeProvider>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let catalog = Arc::new(Catalog::open(store, config.log_retention)?);
        let enumerator = Enumerator::with_limits(
            Arc::clone(&catalog),
            config.page_size,
            config.change_batch_size,
            config.listing_ttl,
        );
        let materializer = Arc::new(Materializer::with_retry(
            Arc::clone(&catalog),
            Arc::clone(&engine),
            config.content_dir.clone(),
            config.fetch_retries,
            config.retry_backoff,
        ));
        // Copies of items removed while no bridge was running.
        if let Err(e) = materializer.sweep() {
            warn!("could not sweep content dir {}: {}", config.content_dir.display(), e);
        }
        let ingestor = Arc::new(
            Ingestor::new(Arc::clone(&catalog), engine, config.poll_interval)
                .with_materializer(Arc::clone(&materializer)),
        );
        let broker = Arc::new(ScopedAccessBroker::new(
            scopes,
            config.bookmark_search_depth,
        ));

        info!(
            "bridge ready (content dir {}, store {})",
            config.content_dir.display(),
            config
                .store_path
                .as_ref()
                .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
        );

        Ok(Self {
            config,
            catalog,
            enumerator,
            materializer,
            ingestor,
            broker,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn enumerator(&self) -> &Enumerator {
        &self.enumerator
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn broker(&self) -> &Arc<ScopedAccessBroker> {
        &self.broker
    }

    /// Method channel over this bridge's broker.
    pub fn channel(&self, picker: Arc<dyn FolderPicker>) -> BookmarkChannel {
        BookmarkChannel::new(Arc::clone(&self.broker), picker)
    }

    /// Run the ingest loop on the current runtime until `cancel` fires.
    pub fn spawn_ingest(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let ingestor = Arc::clone(&self.ingestor);
        tokio::spawn(async move { ingestor.run(cancel).await })
    }
}
