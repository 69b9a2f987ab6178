//! Reference-counted access sessions.
//!
//! Every resolved location (path plus access mode) has one [`ScopeEntry`] guarded by its
//! own mutex. The first activation acquires the right from the [`ScopeProvider`], later
//! ones only bump the count, and the right is released when the count returns to zero.
//! Because acquire and release happen while the entry's mutex is held, a release can never
//! race an acquire for the same location, and unrelated locations never contend.
//!
//! Revocation is recorded before any entry is visited, and activation checks it with the
//! entry's mutex held. An activation either sees the revocation and is refused, or lands
//! in an entry the revocation has yet to visit and is cut there.

use super::scope::ScopeProvider;
use super::token::{AccessMode, TokenDigest};
use super::BrokerError;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopeKey {
    path: PathBuf,
    mode: AccessMode,
}

#[derive(Debug, Default)]
struct ScopeEntry {
    count: usize,
    /// Live sessions per token.
    holders: HashMap<TokenDigest, usize>,
    /// Released and unlinked from the registry; a fresh entry replaces it.
    retired: bool,
}

/// Registry of live scopes.
pub(crate) struct ScopeRegistry {
    provider: Arc<dyn ScopeProvider>,
    entries: DashMap<ScopeKey, Arc<Mutex<ScopeEntry>>>,
    revoked: DashSet<TokenDigest>,
}

impl ScopeRegistry {
    pub(crate) fn new(provider: Arc<dyn ScopeProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            entries: DashMap::new(),
            revoked: DashSet::new(),
        })
    }

    pub(crate) fn activate(
        self: &Arc<Self>,
        digest: TokenDigest,
        path: &Path,
        mode: AccessMode,
    ) -> Result<AccessSession, BrokerError> {
        let key = ScopeKey {
            path: path.to_path_buf(),
            mode,
        };
        loop {
            let entry = Arc::clone(self.entries.entry(key.clone()).or_default().value());
            let mut scope = entry.lock();
            if scope.retired {
                // Lost a race with the final release; pick up the replacement.
                continue;
            }
            if self.revoked.contains(&digest) {
                if scope.count == 0 {
                    scope.retired = true;
                    self.unlink(&key, &entry);
                }
                return Err(BrokerError::AccessDenied {
                    path: path.to_path_buf(),
                    reason: "token revoked".into(),
                });
            }
            if scope.count == 0 {
                if let Err(e) = self.provider.acquire(path, mode) {
                    scope.retired = true;
                    self.unlink(&key, &entry);
                    return Err(BrokerError::AccessDenied {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
                debug!("scope acquired: {} ({mode})", path.display());
            }
            scope.count += 1;
            *scope.holders.entry(digest).or_default() += 1;
            trace!("scope {} count now {}", path.display(), scope.count);
            drop(scope);

            return Ok(AccessSession {
                registry: Arc::clone(self),
                key,
                digest,
                entry,
                released: false,
            });
        }
    }

    fn unlink(&self, key: &ScopeKey, entry: &Arc<Mutex<ScopeEntry>>) {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry));
    }

    /// Drop one session's hold. The right is released when the last hold goes.
    fn release(&self, key: &ScopeKey, digest: TokenDigest, entry: &Arc<Mutex<ScopeEntry>>) {
        let mut scope = entry.lock();
        if scope.retired {
            return;
        }
        let Some(held) = scope.holders.get_mut(&digest) else {
            // The token was revoked while this session was live.
            return;
        };
        *held -= 1;
        if *held == 0 {
            scope.holders.remove(&digest);
        }
        scope.count -= 1;
        trace!("scope {} count now {}", key.path.display(), scope.count);
        if scope.count == 0 {
            self.retire(key, entry, &mut scope);
        }
    }

    fn retire(&self, key: &ScopeKey, entry: &Arc<Mutex<ScopeEntry>>, scope: &mut ScopeEntry) {
        self.provider.release(&key.path);
        scope.retired = true;
        self.unlink(key, entry);
        debug!("scope released: {}", key.path.display());
    }

    /// Withdraw every hold `digest` has and refuse its later activations. Returns how many
    /// sessions were cut.
    pub(crate) fn revoke(&self, digest: TokenDigest) -> usize {
        self.revoked.insert(digest);
        let mut cut = 0;
        for (key, entry) in self.live_entries() {
            let mut scope = entry.lock();
            if scope.retired {
                continue;
            }
            if let Some(held) = scope.holders.remove(&digest) {
                cut += held;
                scope.count -= held;
                if scope.count == 0 {
                    self.retire(&key, &entry, &mut scope);
                }
            }
        }
        cut
    }

    fn live_entries(&self) -> Vec<(ScopeKey, Arc<Mutex<ScopeEntry>>)> {
        // Entry locks are never taken while a map shard is held.
        self.entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub(crate) fn is_revoked(&self, digest: TokenDigest) -> bool {
        self.revoked.contains(&digest)
    }

    /// Whether `digest` holds any live session.
    pub(crate) fn holds(&self, digest: TokenDigest) -> bool {
        self.live_entries()
            .iter()
            .any(|(_, entry)| entry.lock().holders.contains_key(&digest))
    }

    /// Live activation count for a location.
    pub(crate) fn count(&self, path: &Path, mode: AccessMode) -> usize {
        let key = ScopeKey {
            path: path.to_path_buf(),
            mode,
        };
        let entry = self.entries.get(&key).map(|e| Arc::clone(e.value()));
        entry.map_or(0, |e| e.lock().count)
    }
}

/// A live activation. Dropping it, or calling [`deactivate`](Self::deactivate), releases
/// its hold exactly once.
pub struct AccessSession {
    registry: Arc<ScopeRegistry>,
    key: ScopeKey,
    digest: TokenDigest,
    entry: Arc<Mutex<ScopeEntry>>,
    released: bool,
}

impl std::fmt::Debug for AccessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSession")
            .field("path", &self.key.path)
            .field("mode", &self.key.mode)
            .field("token", &self.digest)
            .finish_non_exhaustive()
    }
}

impl AccessSession {
    pub fn path(&self) -> &Path {
        &self.key.path
    }

    pub fn mode(&self) -> AccessMode {
        self.key.mode
    }

    pub fn token(&self) -> TokenDigest {
        self.digest
    }

    /// Whether this session still holds the right (false after revocation).
    pub fn is_active(&self) -> bool {
        let scope = self.entry.lock();
        !scope.retired && scope.holders.contains_key(&self.digest)
    }

    pub fn deactivate(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.key, self.digest, &self.entry);
        }
    }
}

impl Drop for AccessSession {
    fn drop(&mut self) {
        self.release();
    }
}
