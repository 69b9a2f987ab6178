//! Item identifiers and metadata records.
//!
//! The host filesystem layer names every file and folder by an opaque string that stays
//! stable for the lifetime of the object and is never reused. The sync engine chooses
//! those strings; the bridge only reserves two of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the root container.
pub const ROOT_ITEM_IDENTIFIER: &str = "root";

/// Working set container identifier.
///
/// Enumerates as the whole tree: listing yields the root's children and change replay
/// yields every change.
pub const WORKING_SET_IDENTIFIER: &str = ".workingset";

/// Display name of the synthetic root item.
pub const ROOT_FILENAME: &str = "Root";

/// Type tag for regular files when the sync engine reports none.
pub const DEFAULT_FILE_TYPE: &str = "public.data";

/// Type tag for folders.
pub const FOLDER_TYPE: &str = "public.folder";

/// Opaque, stable identifier of one item in the virtual tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemIdentifier(String);

impl ItemIdentifier {
    /// Wrap an identifier issued by the sync engine.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The root container.
    pub fn root() -> Self {
        Self(ROOT_ITEM_IDENTIFIER.to_string())
    }

    /// The working set pseudo-container.
    pub fn working_set() -> Self {
        Self(WORKING_SET_IDENTIFIER.to_string())
    }

    /// Mint a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Whether this names the root container.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ITEM_IDENTIFIER
    }

    /// Whether this names the working set.
    pub fn is_working_set(&self) -> bool {
        self.0 == WORKING_SET_IDENTIFIER
    }

    /// Whether the bridge reserves this identifier for itself.
    pub fn is_reserved(&self) -> bool {
        self.is_root() || self.is_working_set()
    }

    /// Borrow the raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ItemIdentifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Regular file
    File,
    /// Folder (container)
    Folder,
}

/// What the host may do with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    pub renamable: bool,
    pub deletable: bool,
}

impl Capabilities {
    /// Everything allowed.
    pub const ALL: Self = Self {
        readable: true,
        writable: true,
        renamable: true,
        deletable: true,
    };

    /// Read access only.
    pub const READ_ONLY: Self = Self {
        readable: true,
        writable: false,
        renamable: false,
        deletable: false,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::ALL
    }
}

/// Metadata record for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub identifier: ItemIdentifier,
    /// Absent only for the root.
    pub parent: Option<ItemIdentifier>,
    pub filename: String,
    pub kind: ItemKind,
    /// Absent for folders.
    pub size: Option<u64>,
    pub content_type: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ItemMetadata {
    /// A file record with default type tag and capabilities.
    pub fn file(
        identifier: impl Into<ItemIdentifier>,
        parent: impl Into<ItemIdentifier>,
        filename: impl Into<String>,
        size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            identifier: identifier.into(),
            parent: Some(parent.into()),
            filename: filename.into(),
            kind: ItemKind::File,
            size: Some(size),
            content_type: DEFAULT_FILE_TYPE.to_string(),
            created: now,
            modified: now,
            capabilities: Capabilities::default(),
        }
    }

    /// A folder record.
    pub fn folder(
        identifier: impl Into<ItemIdentifier>,
        parent: impl Into<ItemIdentifier>,
        filename: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            identifier: identifier.into(),
            parent: Some(parent.into()),
            filename: filename.into(),
            kind: ItemKind::Folder,
            size: None,
            content_type: FOLDER_TYPE.to_string(),
            created: now,
            modified: now,
            capabilities: Capabilities::default(),
        }
    }

    /// Synthetic root record.
    pub fn root() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            identifier: ItemIdentifier::root(),
            parent: None,
            filename: ROOT_FILENAME.to_string(),
            kind: ItemKind::Folder,
            size: None,
            content_type: FOLDER_TYPE.to_string(),
            created: epoch,
            modified: epoch,
            capabilities: Capabilities::READ_ONLY,
        }
    }

    /// Set the type tag.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    /// Parent identifier, treating a missing parent as the root.
    pub fn parent_or_root(&self) -> ItemIdentifier {
        self.parent.clone().unwrap_or_else(ItemIdentifier::root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_identifier() {
        assert!(ItemIdentifier::root().is_root());
        assert!(ItemIdentifier::root().is_reserved());
        assert!(ItemIdentifier::working_set().is_reserved());
        assert!(!ItemIdentifier::new("abc").is_reserved());
    }

    #[test]
    fn test_generated_identifiers_are_unique() {
        let a = ItemIdentifier::generate();
        let b = ItemIdentifier::generate();
        assert_ne!(a, b);
        assert!(!a.is_reserved());
    }

    #[test]
    fn test_root_metadata() {
        let root = ItemMetadata::root();
        assert_eq!(root.filename, "Root");
        assert_eq!(root.kind, ItemKind::Folder);
        assert!(root.parent.is_none());
        assert!(root.size.is_none());
    }

    #[test]
    fn test_folder_has_no_size() {
        let folder = ItemMetadata::folder("f1", ItemIdentifier::root(), "Docs");
        assert!(folder.size.is_none());
        assert_eq!(folder.content_type, FOLDER_TYPE);

        let file = ItemMetadata::file("a", "f1", "a.txt", 12).with_content_type("public.plain-text");
        assert_eq!(file.size, Some(12));
        assert_eq!(file.content_type, "public.plain-text");
    }

    #[test]
    fn test_metadata_json_shape() {
        let file = ItemMetadata::file("a", "root", "a.txt", 3);
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["identifier"], "a");
        assert_eq!(json["kind"], "file");
        assert_eq!(json["capabilities"]["readable"], true);
    }
}
