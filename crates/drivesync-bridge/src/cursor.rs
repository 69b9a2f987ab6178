//! Change cursors and the ordered mutation log.
//!
//! Every catalog mutation appends one [`ChangeEntry`]. A [`ChangeCursor`] marks a position
//! in that log: the consumer has seen every entry up to and including `seq`. Cursors are
//! rendered as opaque base64url strings carrying the log epoch, so a cursor issued by a
//! previous log generation is recognised and expired rather than misread.

use crate::item::{ItemIdentifier, ItemMetadata};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for cursor operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// The cursor points before the oldest retained entry (or at a previous log
    /// generation). The consumer must restart from a full listing.
    #[error("cursor {cursor} expired (oldest retained position is {floor})")]
    Expired {
        /// The rejected cursor.
        cursor: String,
        /// Oldest position still replayable.
        floor: u64,
    },

    /// The cursor could not be decoded or points past the end of the log.
    #[error("invalid cursor: {0}")]
    Invalid(String),
}

/// Opaque, ordered position in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeCursor {
    epoch: u32,
    seq: u64,
}

const CURSOR_LEN: usize = 12;

impl ChangeCursor {
    /// Starting point for a consumer with no prior state. Replays every retained change,
    /// or expires if the log has already been pruned.
    pub const ORIGIN: Self = Self { epoch: 0, seq: 0 };

    pub(crate) fn new(epoch: u32, seq: u64) -> Self {
        Self { epoch, seq }
    }

    /// Sequence number of the last entry covered by this cursor.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether this is the origin cursor.
    pub fn is_origin(&self) -> bool {
        self.epoch == 0 && self.seq == 0
    }

    /// Encode to the opaque wire form.
    pub fn encode(&self) -> String {
        let mut bytes = [0u8; CURSOR_LEN];
        bytes[..4].copy_from_slice(&self.epoch.to_be_bytes());
        bytes[4..].copy_from_slice(&self.seq.to_be_bytes());
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Decode the opaque wire form. The empty string is the origin.
    pub fn decode(s: &str) -> Result<Self, CursorError> {
        if s.is_empty() {
            return Ok(Self::ORIGIN);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| CursorError::Invalid(format!("{s}: {e}")))?;
        let bytes: [u8; CURSOR_LEN] = bytes
            .try_into()
            .map_err(|_| CursorError::Invalid(format!("{s}: wrong length")))?;
        let mut epoch = [0u8; 4];
        epoch.copy_from_slice(&bytes[..4]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[4..]);
        Ok(Self {
            epoch: u32::from_be_bytes(epoch),
            seq: u64::from_be_bytes(seq),
        })
    }
}

impl fmt::Display for ChangeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ChangeCursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for ChangeCursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ChangeCursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// What happened to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One logged catalog mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Position in the log, starting at 1.
    pub seq: u64,
    pub identifier: ItemIdentifier,
    pub kind: ChangeKind,
    /// Metadata as written; `None` for deletions.
    pub metadata: Option<ItemMetadata>,
    /// Parent chain at mutation time, nearest first, ending with the root.
    pub ancestors: Vec<ItemIdentifier>,
    /// Parent chain before the mutation when the item moved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_ancestors: Option<Vec<ItemIdentifier>>,
    pub recorded_at: DateTime<Utc>,
}

impl ChangeEntry {
    /// Whether the item sat under `container` after this mutation.
    pub fn is_under(&self, container: &ItemIdentifier) -> bool {
        self.ancestors.iter().any(|a| a == container)
    }

    /// Whether the item sat under `container` before this mutation moved it.
    pub fn was_under(&self, container: &ItemIdentifier) -> bool {
        self.previous_ancestors
            .as_ref()
            .is_some_and(|chain| chain.iter().any(|a| a == container))
    }
}

/// Entries returned by [`ChangeLog::since`].
#[derive(Debug, Clone)]
pub struct ChangeSlice {
    pub entries: Vec<ChangeEntry>,
    /// Position after the last returned entry (unchanged if none).
    pub next_cursor: ChangeCursor,
    /// More entries exist beyond `next_cursor` right now.
    pub more: bool,
}

/// Append-only, totally ordered log of catalog mutations.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    epoch: u32,
    /// Highest pruned sequence number; cursors below it are expired.
    floor: u64,
    next_seq: u64,
    entries: VecDeque<ChangeEntry>,
}

impl ChangeLog {
    /// A fresh log with a new random epoch.
    pub fn new() -> Self {
        Self::with_epoch(new_epoch())
    }

    pub(crate) fn with_epoch(epoch: u32) -> Self {
        Self {
            epoch,
            floor: 0,
            next_seq: 1,
            entries: VecDeque::new(),
        }
    }

    /// Rebuild a log from persisted state.
    ///
    /// Returns `None` when the persisted entries are not strictly ordered above the floor.
    pub(crate) fn restore(epoch: u32, floor: u64, entries: Vec<ChangeEntry>) -> Option<Self> {
        let mut expected = floor + 1;
        for entry in &entries {
            if entry.seq != expected {
                return None;
            }
            expected += 1;
        }
        Some(Self {
            epoch,
            floor,
            next_seq: expected,
            entries: entries.into(),
        })
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cursor positioned after the newest entry.
    pub fn current(&self) -> ChangeCursor {
        ChangeCursor::new(self.epoch, self.next_seq - 1)
    }

    /// Sequence number the next appended entry will receive.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter()
    }

    /// Append an entry, assigning its sequence number.
    pub fn append(&mut self, mut entry: ChangeEntry) -> ChangeCursor {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(entry);
        self.current()
    }

    /// Floor the log would have after appending `incoming` entries under `retention`.
    pub(crate) fn floor_after(&self, incoming: usize, retention: usize) -> u64 {
        let total = self.entries.len() + incoming;
        if total <= retention {
            return self.floor;
        }
        self.floor + (total - retention) as u64
    }

    /// Drop every entry with `seq <= floor`.
    pub fn prune_to(&mut self, floor: u64) {
        while self.entries.front().is_some_and(|e| e.seq <= floor) {
            self.entries.pop_front();
        }
        self.floor = self.floor.max(floor).min(self.next_seq - 1);
    }

    /// Keep at most `retention` entries.
    pub fn prune_retaining(&mut self, retention: usize) {
        let floor = self.floor_after(0, retention);
        self.prune_to(floor);
    }

    /// All entries strictly after `cursor`.
    pub fn since(&self, cursor: &ChangeCursor) -> Result<ChangeSlice, CursorError> {
        self.since_limited(cursor, usize::MAX)
    }

    /// At most `limit` entries strictly after `cursor`.
    pub fn since_limited(
        &self,
        cursor: &ChangeCursor,
        limit: usize,
    ) -> Result<ChangeSlice, CursorError> {
        let seq = self.validate(cursor)?;

        // Entries are contiguous from floor + 1.
        let skip = usize::try_from(seq - self.floor).unwrap_or(usize::MAX);
        let entries: Vec<ChangeEntry> = self
            .entries
            .iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect();

        let next_seq = entries.last().map_or(seq, |e| e.seq);
        Ok(ChangeSlice {
            more: next_seq + 1 < self.next_seq,
            next_cursor: ChangeCursor::new(self.epoch, next_seq),
            entries,
        })
    }

    fn validate(&self, cursor: &ChangeCursor) -> Result<u64, CursorError> {
        let origin = cursor.is_origin();
        if !origin && cursor.epoch != self.epoch {
            return Err(CursorError::Expired {
                cursor: cursor.encode(),
                floor: self.floor,
            });
        }
        if cursor.seq < self.floor {
            return Err(CursorError::Expired {
                cursor: cursor.encode(),
                floor: self.floor,
            });
        }
        if cursor.seq >= self.next_seq {
            return Err(CursorError::Invalid(format!(
                "{cursor} is ahead of the log (latest is {})",
                self.next_seq - 1
            )));
        }
        Ok(cursor.seq)
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

fn new_epoch() -> u32 {
    // Epoch 0 is reserved for the origin cursor.
    (uuid::Uuid::new_v4().as_u128() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, kind: ChangeKind) -> ChangeEntry {
        ChangeEntry {
            seq: 0,
            identifier: ItemIdentifier::new(id),
            kind,
            metadata: None,
            ancestors: vec![ItemIdentifier::root()],
            previous_ancestors: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_cursor_encoding() {
        let cursor = ChangeCursor::new(7, 42);
        let encoded = cursor.encode();
        assert!(!encoded.contains('/'));
        assert_eq!(ChangeCursor::decode(&encoded).unwrap(), cursor);
        assert_eq!(ChangeCursor::decode("").unwrap(), ChangeCursor::ORIGIN);
        assert!(matches!(
            ChangeCursor::decode("not a cursor!"),
            Err(CursorError::Invalid(_))
        ));
        assert!(matches!(
            ChangeCursor::decode("AAAA"),
            Err(CursorError::Invalid(_))
        ));
    }

    #[test]
    fn test_since_returns_entries_after_cursor() {
        let mut log = ChangeLog::with_epoch(1);
        let start = log.current();
        log.append(entry("a", ChangeKind::Created));
        let mid = log.append(entry("b", ChangeKind::Created));
        log.append(entry("a", ChangeKind::Deleted));

        let all = log.since(&start).unwrap();
        assert_eq!(all.entries.len(), 3);
        assert_eq!(all.next_cursor, log.current());
        assert!(!all.more);

        let tail = log.since(&mid).unwrap();
        assert_eq!(tail.entries.len(), 1);
        assert_eq!(tail.entries[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_since_current_is_empty_and_unchanged() {
        let mut log = ChangeLog::with_epoch(1);
        log.append(entry("a", ChangeKind::Created));
        let now = log.current();
        let slice = log.since(&now).unwrap();
        assert!(slice.entries.is_empty());
        assert_eq!(slice.next_cursor, now);
    }

    #[test]
    fn test_limited_reports_more() {
        let mut log = ChangeLog::with_epoch(1);
        for i in 0..5 {
            log.append(entry(&format!("i{i}"), ChangeKind::Created));
        }
        let first = log.since_limited(&ChangeCursor::ORIGIN, 2).unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.more);
        let rest = log.since_limited(&first.next_cursor, 10).unwrap();
        assert_eq!(rest.entries.len(), 3);
        assert!(!rest.more);
    }

    #[test]
    fn test_pruned_cursor_expires() {
        let mut log = ChangeLog::with_epoch(1);
        let old = log.current();
        for i in 0..10 {
            log.append(entry(&format!("i{i}"), ChangeKind::Created));
        }
        log.prune_retaining(4);
        assert_eq!(log.len(), 4);
        assert_eq!(log.floor(), 6);
        assert!(matches!(log.since(&old), Err(CursorError::Expired { .. })));
        assert!(matches!(
            log.since(&ChangeCursor::ORIGIN),
            Err(CursorError::Expired { .. })
        ));
        let at_floor = ChangeCursor::new(1, 6);
        assert_eq!(log.since(&at_floor).unwrap().entries.len(), 4);
    }

    #[test]
    fn test_foreign_epoch_expires() {
        let mut log = ChangeLog::with_epoch(1);
        log.append(entry("a", ChangeKind::Created));
        let foreign = ChangeCursor::new(2, 1);
        assert!(matches!(log.since(&foreign), Err(CursorError::Expired { .. })));
    }

    #[test]
    fn test_future_cursor_is_invalid() {
        let log = ChangeLog::with_epoch(1);
        let ahead = ChangeCursor::new(1, 5);
        assert!(matches!(log.since(&ahead), Err(CursorError::Invalid(_))));
    }

    #[test]
    fn test_restore_rejects_gaps() {
        let mut a = entry("a", ChangeKind::Created);
        a.seq = 3;
        let mut b = entry("b", ChangeKind::Created);
        b.seq = 5;
        assert!(ChangeLog::restore(1, 2, vec![a.clone(), b]).is_none());

        let restored = ChangeLog::restore(1, 2, vec![a]).unwrap();
        assert_eq!(restored.current().seq(), 3);
    }
}
