//! Virtual filesystem bridge for DriveSync.
//!
//! The bridge sits between a host file-browsing system and the DriveSync sync engine:
//!
//! - [`catalog`] maps opaque item identifiers to metadata and hierarchy, logging every
//!   mutation to an ordered change log ([`cursor`]) in the same atomic step.
//! - [`enumeration`] serves snapshot listings and cursor-based change replay per container.
//! - [`materializer`] renders placeholders and fetches content on demand, cancellably.
//! - [`ingest`] pulls the sync engine's mutation feed into the catalog.
//! - [`broker`] wraps user-chosen folders into portable bookmark tokens and manages
//!   reference-counted access sessions, including the single-slot folder picker.
//! - [`channel`] is the request/response surface the application shell talks to.
//!
//! [`DriveBridge`] wires the components together from a [`BridgeConfig`].

#![warn(clippy::all)]

pub mod bridge;
pub mod broker;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod enumeration;
pub mod error;
pub mod ingest;
pub mod item;
pub mod materializer;
pub mod store;

pub use bridge::DriveBridge;
pub use broker::{
    AccessMode, AccessSession, Bookmark, BrokerError, FolderPicker, FsScopeProvider,
    PickOutcome, PickedDirectory, ResolvedBookmark, ScopeProvider, ScopedAccessBroker,
    TokenState,
};
pub use catalog::{Catalog, CatalogError};
pub use channel::{BookmarkChannel, ChannelError};
pub use config::BridgeConfig;
pub use cursor::{ChangeCursor, ChangeEntry, ChangeKind, CursorError};
pub use engine::{ContentStream, Mutation, MutationBatch, RemoteCursor, SyncEngine, SyncError};
pub use enumeration::{Change, ChangeBatch, EnumerationError, Enumerator, ListingPage, PageToken};
pub use error::{BridgeError, ErrorCategory};
pub use ingest::{IngestError, IngestReport, Ingestor};
pub use item::{Capabilities, ItemIdentifier, ItemKind, ItemMetadata};
pub use materializer::{MaterializeError, MaterializedFile, Materializer, PlaceholderDescriptor};
pub use store::{CatalogStore, JsonFileStore, MemoryStore, StoreError};
