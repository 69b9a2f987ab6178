//! Error taxonomy for the bridge.
//!
//! Each component reports its own error enum. [`ErrorCategory`] classifies all of them
//! the same way so the host, the channel layer and the CLI can decide how to react
//! without matching on every variant:
//!
//! | Category | Caller reaction |
//! |---|---|
//! | `NotFound` | treat the item as gone |
//! | `Inconsistency` | the mutation was rejected as a whole |
//! | `Transient` | re-list, retry, or re-prompt |
//! | `UserDeclined` | a normal outcome, not a fault |
//! | `Contention` | wait and retry; never queued |
//! | `Internal` | local storage or bug |
//!
//! [`BridgeError`] wraps every component error and maps it to an errno value and a host
//! error-domain string.

use crate::broker::BrokerError;
use crate::catalog::CatalogError;
use crate::cursor::CursorError;
use crate::engine::SyncError;
use crate::enumeration::EnumerationError;
use crate::ingest::IngestError;
use crate::materializer::MaterializeError;
use crate::store::StoreError;
use thiserror::Error;

/// Semantic category of a bridge error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Inconsistency,
    Transient,
    UserDeclined,
    Contention,
    Internal,
}

impl ErrorCategory {
    /// Whether the caller can recover without operator intervention.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::Inconsistency | Self::Internal)
    }
}

impl From<&CursorError> for ErrorCategory {
    fn from(e: &CursorError) -> Self {
        match e {
            CursorError::Expired { .. } => Self::Transient,
            CursorError::Invalid(_) => Self::Inconsistency,
        }
    }
}

impl From<&StoreError> for ErrorCategory {
    fn from(_: &StoreError) -> Self {
        Self::Internal
    }
}

impl From<&CatalogError> for ErrorCategory {
    fn from(e: &CatalogError) -> Self {
        match e {
            CatalogError::NotFound(_) => Self::NotFound,
            CatalogError::NotAContainer(_)
            | CatalogError::DanglingParent { .. }
            | CatalogError::CycleDetected { .. }
            | CatalogError::KindConflict(_)
            | CatalogError::ReservedIdentifier(_) => Self::Inconsistency,
            CatalogError::Store(e) => e.into(),
            CatalogError::Cursor(e) => e.into(),
        }
    }
}

impl From<&EnumerationError> for ErrorCategory {
    fn from(e: &EnumerationError) -> Self {
        match e {
            EnumerationError::Catalog(e) => e.into(),
            EnumerationError::PageExpired => Self::Transient,
            EnumerationError::InvalidPage(_) => Self::Inconsistency,
        }
    }
}

impl From<&SyncError> for ErrorCategory {
    fn from(e: &SyncError) -> Self {
        match e {
            SyncError::NotFound(_) => Self::NotFound,
            SyncError::Transfer(_) | SyncError::Unavailable(_) => Self::Transient,
        }
    }
}

impl From<&MaterializeError> for ErrorCategory {
    fn from(e: &MaterializeError) -> Self {
        match e {
            MaterializeError::NotFound(_) => Self::NotFound,
            MaterializeError::NotAFile(_) => Self::Inconsistency,
            MaterializeError::TransferFailed { .. } => Self::Transient,
            MaterializeError::Cancelled(_) => Self::UserDeclined,
            MaterializeError::Io { .. } => Self::Internal,
            MaterializeError::Catalog(e) => e.into(),
        }
    }
}

impl From<&IngestError> for ErrorCategory {
    fn from(e: &IngestError) -> Self {
        match e {
            IngestError::Sync(e) => e.into(),
            IngestError::Catalog(e) => e.into(),
        }
    }
}

impl From<&BrokerError> for ErrorCategory {
    fn from(e: &BrokerError) -> Self {
        match e {
            BrokerError::InvalidPath(_) | BrokerError::InvalidToken(_) => Self::Inconsistency,
            BrokerError::BookmarkFailed { .. } | BrokerError::Unreadable(_) => Self::NotFound,
            BrokerError::AccessDenied { .. } => Self::Transient,
            BrokerError::Busy => Self::Contention,
            BrokerError::NoSelection | BrokerError::Cancelled => Self::UserDeclined,
        }
    }
}

/// Any error the bridge reports.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Configuration could not be used.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::Catalog(e) => e.into(),
            BridgeError::Cursor(e) => e.into(),
            BridgeError::Enumeration(e) => e.into(),
            BridgeError::Materialize(e) => e.into(),
            BridgeError::Ingest(e) => e.into(),
            BridgeError::Broker(e) => e.into(),
            BridgeError::Store(e) => e.into(),
            BridgeError::Sync(e) => e.into(),
            BridgeError::Config(_) => ErrorCategory::Internal,
        }
    }

    /// Get the errno-like error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            BridgeError::Catalog(CatalogError::NotAContainer(_))
            | BridgeError::Enumeration(EnumerationError::Catalog(CatalogError::NotAContainer(_))) => {
                libc::ENOTDIR
            }
            BridgeError::Materialize(MaterializeError::NotAFile(_)) => libc::EISDIR,
            BridgeError::Broker(BrokerError::AccessDenied { .. }) => libc::EACCES,
            BridgeError::Materialize(MaterializeError::Cancelled(_))
            | BridgeError::Broker(BrokerError::Cancelled) => libc::ECANCELED,
            _ => match self.category() {
                ErrorCategory::NotFound => libc::ENOENT,
                ErrorCategory::Inconsistency => libc::EINVAL,
                ErrorCategory::Transient => libc::EAGAIN,
                ErrorCategory::UserDeclined => libc::ECANCELED,
                ErrorCategory::Contention => libc::EBUSY,
                ErrorCategory::Internal => libc::EIO,
            },
        }
    }

    /// Get the NSFileProviderError domain string for this error.
    pub fn error_domain(&self) -> &'static str {
        match self {
            BridgeError::Cursor(CursorError::Expired { .. })
            | BridgeError::Catalog(CatalogError::Cursor(CursorError::Expired { .. }))
            | BridgeError::Enumeration(EnumerationError::Catalog(CatalogError::Cursor(
                CursorError::Expired { .. },
            ))) => "NSFileProviderErrorSyncAnchorExpired",
            BridgeError::Enumeration(EnumerationError::PageExpired) => {
                "NSFileProviderErrorPageExpired"
            }
            BridgeError::Broker(BrokerError::AccessDenied { .. }) => {
                "NSFileProviderErrorNotAuthenticated"
            }
            _ => match self.category() {
                ErrorCategory::NotFound => "NSFileProviderErrorNoSuchItem",
                ErrorCategory::Transient => "NSFileProviderErrorServerUnreachable",
                ErrorCategory::UserDeclined => "NSUserCancelledError",
                ErrorCategory::Contention => "NSFileProviderErrorCannotSynchronize",
                ErrorCategory::Inconsistency | ErrorCategory::Internal => {
                    "NSFileProviderErrorCannotSynchronize"
                }
            },
        }
    }
}
