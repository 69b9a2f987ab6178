//! Bridge configuration.
//!
//! Every field has a default, so an empty document is a valid configuration. Durations are
//! written in humantime form (`"250ms"`, `"5m"`).
//!
//! ```toml
//! content_dir = "/var/cache/drivesync/content"
//! store_path = "/var/lib/drivesync/catalog.json"
//! page_size = 100
//! listing_ttl = "5m"
//! retry_backoff = "250ms"
//! ```

use crate::broker::DEFAULT_SEARCH_DEPTH;
use crate::catalog::DEFAULT_LOG_RETENTION;
use crate::enumeration::{DEFAULT_CHANGE_BATCH_SIZE, DEFAULT_LISTING_TTL, DEFAULT_PAGE_SIZE};
use crate::error::BridgeError;
use crate::ingest::DEFAULT_POLL_INTERVAL;
use crate::materializer::{DEFAULT_FETCH_RETRIES, DEFAULT_RETRY_BACKOFF};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`DriveBridge`](crate::DriveBridge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Where materialized content lives.
    pub content_dir: PathBuf,
    /// JSON store file; in-memory when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    pub page_size: usize,
    pub change_batch_size: usize,
    /// Change entries retained before pruning.
    pub log_retention: usize,
    #[serde(with = "humantime_serde")]
    pub listing_ttl: Duration,
    /// Extra attempts for a failed content fetch.
    pub fetch_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Directory depth searched when recovering a moved bookmark.
    pub bookmark_search_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            store_path: None,
            page_size: DEFAULT_PAGE_SIZE,
            change_batch_size: DEFAULT_CHANGE_BATCH_SIZE,
            log_retention: DEFAULT_LOG_RETENTION,
            listing_ttl: DEFAULT_LISTING_TTL,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            poll_interval: DEFAULT_POLL_INTERVAL,
            bookmark_search_depth: DEFAULT_SEARCH_DEPTH,
        }
    }
}

fn default_content_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("drivesync")
        .join("content")
}

impl BridgeConfig {
    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.page_size == 0 {
            return Err(BridgeError::Config("page_size must be at least 1".into()));
        }
        if self.change_batch_size == 0 {
            return Err(BridgeError::Config(
                "change_batch_size must be at least 1".into(),
            ));
        }
        if self.log_retention == 0 {
            return Err(BridgeError::Config("log_retention must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(BridgeError::Config("poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}
