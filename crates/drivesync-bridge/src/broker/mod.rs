//! Scoped-access broker.
//!
//! Wraps user-chosen locations into portable bookmark tokens and turns tokens back into
//! counted access sessions. The broker never chooses a location itself: tokens are minted
//! from a path the application already has, or from the result of [`pick_directory`].
//!
//! Token lifecycle:
//!
//! ```text
//! Unresolved --resolve--> Resolved --activate--> Active --last deactivate--> Resolved
//!      \                      \                     \
//!       +------------------revoke-------------------+--> Revoked
//! ```
//!
//! [`pick_directory`]: ScopedAccessBroker::pick_directory

pub mod picker;
pub mod scope;
pub mod session;
pub mod token;

pub use picker::{FolderPicker, PickOutcome, PickerSession};
pub use scope::{FsScopeProvider, ScopeProvider};
pub use session::AccessSession;
pub use token::{AccessMode, Bookmark, FileId, ResolvedBookmark, TokenDigest, DEFAULT_SEARCH_DEPTH};

use dashmap::DashMap;
use session::ScopeRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Error type for broker operations.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The location is not an absolute path or local file URL.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Token bytes could not be decoded from their transport encoding.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The location exists but could not be wrapped.
    #[error("cannot bookmark {path}: {reason}")]
    BookmarkFailed { path: PathBuf, reason: String },

    /// The token is corrupt or its referent is gone.
    #[error("bookmark unreadable: {0}")]
    Unreadable(String),

    #[error("access denied to {path}: {reason}")]
    AccessDenied { path: PathBuf, reason: String },

    /// Another selection request is pending.
    #[error("a folder selection is already in progress")]
    Busy,

    #[error("no folder selected")]
    NoSelection,

    #[error("folder selection cancelled")]
    Cancelled,
}

/// Lifecycle state of one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unresolved,
    Resolved,
    Active,
    Revoked,
}

/// A folder chosen through the picker, with its freshly minted token.
#[derive(Debug, Clone)]
pub struct PickedDirectory {
    pub path: PathBuf,
    pub bookmark: Bookmark,
}

/// The scoped-access broker.
pub struct ScopedAccessBroker {
    registry: Arc<ScopeRegistry>,
    /// Tokens that have resolved at least once, or were revoked.
    ledger: DashMap<TokenDigest, TokenState>,
    picker: PickerSession,
    search_depth: usize,
}

impl ScopedAccessBroker {
    pub fn new(provider: Arc<dyn ScopeProvider>, search_depth: usize) -> Self {
        Self {
            registry: ScopeRegistry::new(provider),
            ledger: DashMap::new(),
            picker: PickerSession::new(),
            search_depth,
        }
    }

    /// Wrap an already chosen path or `file://` URL.
    pub fn mint(&self, location: &str, mode: AccessMode) -> Result<Bookmark, BrokerError> {
        debug!("mint: {}", location);
        Bookmark::mint(location, mode)
    }

    /// Locate a token's referent.
    pub fn resolve(&self, bookmark: &Bookmark) -> Result<ResolvedBookmark, BrokerError> {
        let digest = bookmark.digest();
        debug!("resolve: {}", digest);
        let resolved = bookmark.resolve(self.search_depth)?;
        self.ledger
            .entry(digest)
            .and_modify(|s| {
                if *s == TokenState::Unresolved {
                    *s = TokenState::Resolved;
                }
            })
            .or_insert(TokenState::Resolved);
        Ok(resolved)
    }

    /// Resolve and activate a token. Activating a location that is already active only
    /// bumps its count.
    pub fn activate(&self, bookmark: &Bookmark) -> Result<(AccessSession, ResolvedBookmark), BrokerError> {
        let digest = bookmark.digest();
        debug!("activate: {}", digest);
        if self.state(bookmark) == TokenState::Revoked {
            return Err(BrokerError::AccessDenied {
                path: PathBuf::new(),
                reason: "token revoked".into(),
            });
        }
        let resolved = self.resolve(bookmark)?;
        let session = self.registry.activate(digest, &resolved.path, resolved.mode)?;
        Ok((session, resolved))
    }

    /// End a session. The right is released when the last session for its location ends.
    pub fn deactivate(&self, session: AccessSession) {
        debug!("deactivate: {}", session.token());
        session.deactivate();
    }

    /// Permanently withdraw a token and cut its live sessions.
    pub fn revoke(&self, bookmark: &Bookmark) {
        let digest = bookmark.digest();
        self.ledger.insert(digest, TokenState::Revoked);
        // Activations already past the ledger check are refused or cut by the registry.
        let cut = self.registry.revoke(digest);
        info!("revoked token {} ({} live session(s) cut)", digest, cut);
    }

    pub fn state(&self, bookmark: &Bookmark) -> TokenState {
        let digest = bookmark.digest();
        let recorded = self.ledger.get(&digest).map(|s| *s);
        match recorded {
            _ if self.registry.is_revoked(digest) => TokenState::Revoked,
            Some(TokenState::Revoked) => TokenState::Revoked,
            _ if self.registry.holds(digest) => TokenState::Active,
            Some(state) => state,
            None => TokenState::Unresolved,
        }
    }

    /// Live activation count for a resolved location.
    pub fn active_count(&self, resolved: &ResolvedBookmark) -> usize {
        self.registry.count(&resolved.path, resolved.mode)
    }

    /// Let the user choose a folder and mint a token for it.
    ///
    /// Only one request may be pending; a concurrent call fails immediately with `Busy`.
    /// [`dismiss_picker`](Self::dismiss_picker) abandons the pending request.
    pub async fn pick_directory(
        &self,
        picker: &dyn FolderPicker,
        mode: AccessMode,
    ) -> Result<PickedDirectory, BrokerError> {
        let slot = self.picker.try_begin()?;
        debug!("pick_directory: prompting");
        let cancel = slot.cancellation().clone();

        let outcome = tokio::select! {
            () = cancel.cancelled() => PickOutcome::Cancelled,
            outcome = picker.pick(cancel.clone()) => outcome,
        };
        let outcome = if cancel.is_cancelled() {
            PickOutcome::Cancelled
        } else {
            outcome
        };

        let result = match outcome {
            PickOutcome::Selected(path) => Bookmark::mint_path(&path, mode).map(|bookmark| {
                PickedDirectory {
                    path: path.canonicalize().unwrap_or(path),
                    bookmark,
                }
            }),
            PickOutcome::NoSelection => Err(BrokerError::NoSelection),
            PickOutcome::Cancelled => Err(BrokerError::Cancelled),
        };
        drop(slot);
        result
    }

    /// Dismiss a pending picker request. Returns whether one was pending.
    pub fn dismiss_picker(&self) -> bool {
        self.picker.cancel_pending()
    }

    pub fn picker_pending(&self) -> bool {
        self.picker.is_pending()
    }
}
