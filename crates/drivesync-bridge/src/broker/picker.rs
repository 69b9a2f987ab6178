//! Interactive folder selection with a single outstanding request.

use super::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a selection prompt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickOutcome {
    Selected(PathBuf),
    /// The prompt completed without a folder.
    NoSelection,
    /// The user abandoned the prompt.
    Cancelled,
}

/// Presents a folder chooser to the user.
///
/// Implementations should stop prompting when `cancel` fires; the broker reports
/// cancellation either way.
#[async_trait]
pub trait FolderPicker: Send + Sync {
    async fn pick(&self, cancel: CancellationToken) -> PickOutcome;
}

#[derive(Debug)]
struct PendingPick {
    id: u64,
    cancel: CancellationToken,
}

/// One-element register of the pending selection request.
#[derive(Debug, Default)]
pub struct PickerSession {
    slot: Mutex<Option<PendingPick>>,
    next_id: AtomicU64,
}

impl PickerSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or fail with `Busy` if a request is already pending.
    pub fn try_begin(&self) -> Result<PickerSlot<'_>, BrokerError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            debug!("picker busy");
            return Err(BrokerError::Busy);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        *slot = Some(PendingPick {
            id,
            cancel: cancel.clone(),
        });
        Ok(PickerSlot {
            session: self,
            id,
            cancel,
        })
    }

    /// Dismiss the pending request, if any. Returns whether one was pending.
    pub fn cancel_pending(&self) -> bool {
        match self.slot.lock().as_ref() {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Ownership of the pending-request slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct PickerSlot<'a> {
    session: &'a PickerSession,
    id: u64,
    cancel: CancellationToken,
}

impl PickerSlot<'_> {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for PickerSlot<'_> {
    fn drop(&mut self) {
        let mut slot = self.session.slot.lock();
        if slot.as_ref().is_some_and(|p| p.id == self.id) {
            *slot = None;
        }
    }
}
