//! Test harness for bridge integration tests.
//!
//! Provides an in-process sync engine, a scope provider that counts grants, a scripted
//! folder picker, and a bridge wired to all three inside a temporary directory.

use async_trait::async_trait;
use drivesync_bridge::{
    AccessMode, BridgeConfig, ContentStream, DriveBridge, FolderPicker, ItemIdentifier,
    ItemMetadata, MemoryStore, Mutation, MutationBatch, PickOutcome, RemoteCursor,
    ScopeProvider, SyncEngine, SyncError,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Sync engine
// ============================================================================

#[derive(Default)]
struct EngineState {
    items: HashMap<ItemIdentifier, ItemMetadata>,
    content: HashMap<ItemIdentifier, Vec<u8>>,
    feed: Vec<Mutation>,
    failing_fetches: usize,
    stall_after_first_chunk: bool,
    offline: bool,
    metadata_offline: bool,
}

/// In-process sync engine with a replayable mutation feed.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    pub content_fetches: AtomicUsize,
    pub polls: AtomicUsize,
    /// Signalled whenever a content stream starts.
    pub fetch_started: Notify,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_folder(&self, id: &str, parent: &str, name: &str) -> ItemMetadata {
        let meta = ItemMetadata::folder(id, parent, name);
        let mut state = self.state.lock();
        state.items.insert(meta.identifier.clone(), meta.clone());
        state.feed.push(Mutation::Upsert(meta.clone()));
        meta
    }

    pub fn put_file(&self, id: &str, parent: &str, name: &str, content: &[u8]) -> ItemMetadata {
        let meta = ItemMetadata::file(id, parent, name, content.len() as u64);
        let mut state = self.state.lock();
        state.items.insert(meta.identifier.clone(), meta.clone());
        state.content.insert(meta.identifier.clone(), content.to_vec());
        state.feed.push(Mutation::Upsert(meta.clone()));
        meta
    }

    /// Change content upstream without announcing it.
    pub fn replace_content_silently(&self, id: &str, content: &[u8]) {
        let id = ItemIdentifier::new(id);
        let mut state = self.state.lock();
        if let Some(meta) = state.items.get_mut(&id) {
            meta.size = Some(content.len() as u64);
        }
        state.content.insert(id, content.to_vec());
    }

    /// Announce a change by identifier only.
    pub fn touch(&self, id: &str) {
        self.state
            .lock()
            .feed
            .push(Mutation::Touched(ItemIdentifier::new(id)));
    }

    pub fn delete(&self, id: &str) {
        let id = ItemIdentifier::new(id);
        let mut state = self.state.lock();
        state.items.remove(&id);
        state.content.remove(&id);
        state.feed.push(Mutation::Remove(id));
    }

    /// Push a raw mutation onto the feed.
    pub fn announce(&self, mutation: Mutation) {
        self.state.lock().feed.push(mutation);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.state.lock().failing_fetches = n;
    }

    pub fn stall_fetches(&self, stall: bool) {
        self.state.lock().stall_after_first_chunk = stall;
    }

    /// Make the mutation feed unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Make metadata lookups unreachable while the feed still answers.
    pub fn set_metadata_offline(&self, offline: bool) {
        self.state.lock().metadata_offline = offline;
    }
}

#[async_trait]
impl SyncEngine for FakeEngine {
    async fn fetch_metadata(&self, id: &ItemIdentifier) -> Result<ItemMetadata, SyncError> {
        let state = self.state.lock();
        if state.metadata_offline {
            return Err(SyncError::Unavailable("metadata offline".into()));
        }
        state
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(id.clone()))
    }

    async fn fetch_content(&self, id: &ItemIdentifier) -> Result<ContentStream, SyncError> {
        self.content_fetches.fetch_add(1, Ordering::SeqCst);
        let (content, stall) = {
            let mut state = self.state.lock();
            if state.failing_fetches > 0 {
                state.failing_fetches -= 1;
                return Err(SyncError::Transfer("injected failure".into()));
            }
            let content = state
                .content
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(id.clone()))?;
            (content, state.stall_after_first_chunk)
        };
        self.fetch_started.notify_waiters();

        let chunks: Vec<Result<Vec<u8>, SyncError>> =
            content.chunks(1024).map(|c| Ok(c.to_vec())).collect();
        if stall {
            let first = chunks.into_iter().take(1);
            return Ok(futures::stream::iter(first)
                .chain(futures::stream::pending())
                .boxed());
        }
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn poll_mutations(
        &self,
        since: Option<&RemoteCursor>,
    ) -> Result<MutationBatch, SyncError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let start: usize = since.and_then(|c| c.0.parse().ok()).unwrap_or(0);
        let state = self.state.lock();
        if state.offline {
            return Err(SyncError::Unavailable("engine offline".into()));
        }
        let mutations = state.feed.get(start..).map(<[Mutation]>::to_vec).unwrap_or_default();
        Ok(MutationBatch {
            mutations,
            cursor: RemoteCursor(state.feed.len().to_string()),
        })
    }
}

// ============================================================================
// Scope provider
// ============================================================================

/// Scope provider that records every grant and release.
#[derive(Default)]
pub struct CountingScopes {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    denied: Mutex<HashSet<PathBuf>>,
}

impl CountingScopes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, path: &Path) {
        self.denied.lock().insert(path.to_path_buf());
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Grants currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }
}

impl ScopeProvider for CountingScopes {
    fn acquire(&self, path: &Path, _mode: AccessMode) -> io::Result<()> {
        if self.denied.lock().contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied by test"));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, _path: &Path) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Folder picker
// ============================================================================

/// Picker that replays queued outcomes. With nothing queued it waits until cancelled.
#[derive(Default)]
pub struct ScriptedPicker {
    outcomes: Mutex<VecDeque<PickOutcome>>,
    pub prompts: AtomicUsize,
    /// Signalled when a prompt starts waiting.
    pub waiting: Notify,
}

impl ScriptedPicker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue(&self, outcome: PickOutcome) {
        self.outcomes.lock().push_back(outcome);
    }
}

#[async_trait]
impl FolderPicker for ScriptedPicker {
    async fn pick(&self, cancel: CancellationToken) -> PickOutcome {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().pop_front();
        if let Some(outcome) = next {
            return outcome;
        }
        self.waiting.notify_waiters();
        cancel.cancelled().await;
        PickOutcome::Cancelled
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// A bridge over the fake collaborators, rooted in a temp directory.
pub struct TestBridge {
    pub temp: TempDir,
    pub bridge: DriveBridge,
    pub engine: Arc<FakeEngine>,
    pub scopes: Arc<CountingScopes>,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut BridgeConfig)) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let mut config = test_config(temp.path());
        adjust(&mut config);
        let engine = FakeEngine::new();
        let scopes = CountingScopes::new();
        let bridge = DriveBridge::with_parts(
            config,
            Arc::new(MemoryStore::new()),
            engine.clone(),
            scopes.clone(),
        )
        .expect("Failed to open bridge");
        Self {
            temp,
            bridge,
            engine,
            scopes,
        }
    }

    /// Pull everything the engine has announced into the catalog.
    pub async fn ingest(&self) {
        self.bridge
            .ingestor()
            .sync_once()
            .await
            .expect("Ingest failed");
    }

    /// Create a real directory under the temp root.
    pub fn mkdir(&self, rel: &str) -> PathBuf {
        let path = self.temp.path().join(rel);
        std::fs::create_dir_all(&path).expect("Failed to create directory");
        path.canonicalize().expect("Failed to canonicalize")
    }
}

/// Config with everything inside `root` and fast retries.
pub fn test_config(root: &Path) -> BridgeConfig {
    BridgeConfig {
        content_dir: root.join("content"),
        store_path: None,
        page_size: 3,
        fetch_retries: 2,
        retry_backoff: Duration::from_millis(1),
        poll_interval: Duration::from_millis(10),
        ..BridgeConfig::default()
    }
}

/// Generate test content with a recognisable pattern.
pub fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

pub fn id(s: &str) -> ItemIdentifier {
    ItemIdentifier::new(s)
}
