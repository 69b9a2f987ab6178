pub mod bookmark;
pub mod catalog;
pub mod pick;
pub mod show_config;

use std::sync::Arc;

use drivesync_bridge::{BridgeConfig, FsScopeProvider, ScopedAccessBroker};

/// Broker backed by real filesystem permissions.
fn filesystem_broker(config: &BridgeConfig) -> ScopedAccessBroker {
    ScopedAccessBroker::new(Arc::new(FsScopeProvider), config.bookmark_search_depth)
}
