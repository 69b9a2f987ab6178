//! Contract for the sync engine collaborator.
//!
//! The sync engine owns the authoritative tree, the content bytes, and all network and
//! credential handling. The catalog, ingestor and materializer only consume it.

use crate::item::{ItemIdentifier, ItemMetadata};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type reported by a sync engine.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The engine does not know the item.
    #[error("item not found upstream: {0}")]
    NotFound(ItemIdentifier),

    /// A transfer failed; retrying may succeed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The engine is offline or not signed in.
    #[error("sync engine unavailable: {0}")]
    Unavailable(String),
}

/// Stream of content chunks.
pub type ContentStream = BoxStream<'static, Result<Vec<u8>, SyncError>>;

/// Opaque position in the sync engine's own mutation feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteCursor(pub String);

/// One upstream mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Item created or changed, with its new metadata.
    Upsert(ItemMetadata),
    /// Item changed; metadata must be fetched.
    Touched(ItemIdentifier),
    /// Item removed.
    Remove(ItemIdentifier),
}

impl Mutation {
    pub fn identifier(&self) -> &ItemIdentifier {
        match self {
            Mutation::Upsert(meta) => &meta.identifier,
            Mutation::Touched(id) | Mutation::Remove(id) => id,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct MutationBatch {
    /// Mutations in the order they must be applied.
    pub mutations: Vec<Mutation>,
    /// Cursor to pass to the next poll.
    pub cursor: RemoteCursor,
}

/// The sync engine.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Authoritative metadata for one item.
    async fn fetch_metadata(&self, id: &ItemIdentifier) -> Result<ItemMetadata, SyncError>;

    /// Content bytes for one file.
    async fn fetch_content(&self, id: &ItemIdentifier) -> Result<ContentStream, SyncError>;

    /// Mutations after `since` (`None` for everything).
    async fn poll_mutations(&self, since: Option<&RemoteCursor>)
        -> Result<MutationBatch, SyncError>;
}
