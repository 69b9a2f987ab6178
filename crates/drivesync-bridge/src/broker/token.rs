//! Portable bookmark tokens.
//!
//! Wire format:
//!
//! ```text
//! +--------+---------+----------------------+---------------------+
//! | "DSBM" | version | SHA-256(payload)     | payload (JSON)      |
//! | 4 B    | 1 B     | 32 B                 | variable            |
//! +--------+---------+----------------------+---------------------+
//! ```
//!
//! The payload records the canonical path, the file identity (device and inode on Unix),
//! the access mode and the mint time. The file identity lets a token follow its folder
//! after a rename of the folder or one of its ancestors.

use super::BrokerError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use url::Url;
use walkdir::WalkDir;

const MAGIC: &[u8; 4] = b"DSBM";
const VERSION: u8 = 1;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 1 + DIGEST_LEN;

/// Default directory depth searched when a bookmarked path has moved.
pub const DEFAULT_SEARCH_DEPTH: usize = 6;

/// Access a token grants once activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessMode::ReadOnly => "read-only",
            AccessMode::ReadWrite => "read-write",
        })
    }
}

/// Filesystem object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl FileId {
    #[cfg(unix)]
    pub fn of(path: &Path) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).ok().map(|m| FileId {
            dev: m.dev(),
            ino: m.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(_path: &Path) -> Option<Self> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BookmarkPayload {
    path: PathBuf,
    file_id: Option<FileId>,
    mode: AccessMode,
    created_at: DateTime<Utc>,
}

/// Stable identity of a token, used as a map key without holding the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenDigest([u8; DIGEST_LEN]);

impl fmt::Display for TokenDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Opaque bookmark token bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Bookmark(Vec<u8>);

impl fmt::Debug for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bookmark({})", self.digest())
    }
}

impl Bookmark {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, BrokerError> {
        STANDARD
            .decode(s.trim())
            .map(Self)
            .map_err(|e| BrokerError::InvalidToken(e.to_string()))
    }

    pub fn digest(&self) -> TokenDigest {
        TokenDigest(Sha256::digest(&self.0).into())
    }

    /// Access mode recorded in the token.
    pub fn mode(&self) -> Result<AccessMode, BrokerError> {
        Ok(self.payload()?.mode)
    }

    /// Wrap an already chosen location. Accepts an absolute path or a `file://` URL.
    pub fn mint(location: &str, mode: AccessMode) -> Result<Self, BrokerError> {
        let path = parse_location(location)?;
        Self::mint_path(&path, mode)
    }

    pub(crate) fn mint_path(path: &Path, mode: AccessMode) -> Result<Self, BrokerError> {
        let canonical = path.canonicalize().map_err(|e| BrokerError::BookmarkFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let payload = BookmarkPayload {
            file_id: FileId::of(&canonical),
            path: canonical,
            mode,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec(&payload).map_err(|e| BrokerError::BookmarkFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + json.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&Sha256::digest(&json));
        bytes.extend_from_slice(&json);

        debug!("minted {mode} bookmark for {}", payload.path.display());
        Ok(Self(bytes))
    }

    fn payload(&self) -> Result<BookmarkPayload, BrokerError> {
        let bytes = &self.0;
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(BrokerError::Unreadable("not a bookmark".into()));
        }
        if bytes[MAGIC.len()] != VERSION {
            return Err(BrokerError::Unreadable(format!(
                "unsupported bookmark version {}",
                bytes[MAGIC.len()]
            )));
        }
        let digest = &bytes[MAGIC.len() + 1..HEADER_LEN];
        let json = &bytes[HEADER_LEN..];
        if Sha256::digest(json).as_slice() != digest {
            return Err(BrokerError::Unreadable("bookmark checksum mismatch".into()));
        }
        serde_json::from_slice(json).map_err(|e| BrokerError::Unreadable(e.to_string()))
    }

    /// Locate the referent.
    ///
    /// The recorded path wins when it still names the same object. Otherwise the nearest
    /// existing ancestor is searched `search_depth` levels deep for the recorded identity,
    /// and a hit is reported as stale.
    pub fn resolve(&self, search_depth: usize) -> Result<ResolvedBookmark, BrokerError> {
        let payload = self.payload()?;
        let mode = payload.mode;

        if payload.path.exists() {
            let current = FileId::of(&payload.path);
            if payload.file_id.is_none() || current == payload.file_id {
                trace!("resolve: {} unchanged", payload.path.display());
                return Ok(ResolvedBookmark {
                    path: payload.path,
                    stale: false,
                    mode,
                });
            }
        }

        let Some(file_id) = payload.file_id else {
            return Err(BrokerError::Unreadable(format!(
                "{} no longer exists",
                payload.path.display()
            )));
        };

        if let Some(found) = search_for(&payload.path, file_id, search_depth) {
            debug!(
                "resolve: {} moved to {}",
                payload.path.display(),
                found.display()
            );
            return Ok(ResolvedBookmark {
                path: found,
                stale: true,
                mode,
            });
        }

        Err(BrokerError::Unreadable(format!(
            "{} no longer exists",
            payload.path.display()
        )))
    }
}

/// Where a token points now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBookmark {
    pub path: PathBuf,
    /// The referent moved; the caller should mint a fresh token for `path`.
    pub stale: bool,
    pub mode: AccessMode,
}

fn parse_location(location: &str) -> Result<PathBuf, BrokerError> {
    let location = location.trim();
    if location.is_empty() {
        return Err(BrokerError::InvalidPath("empty location".into()));
    }
    let path = if location.starts_with("file:") {
        let url = Url::parse(location).map_err(|e| BrokerError::InvalidPath(e.to_string()))?;
        url.to_file_path()
            .map_err(|()| BrokerError::InvalidPath(format!("not a local file URL: {location}")))?
    } else {
        PathBuf::from(location)
    };
    if !path.is_absolute() {
        return Err(BrokerError::InvalidPath(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }
    Ok(path)
}

fn search_for(recorded: &Path, file_id: FileId, depth: usize) -> Option<PathBuf> {
    let base = recorded.ancestors().skip(1).find(|a| a.is_dir())?;
    trace!("resolve: searching {} for moved referent", base.display());
    WalkDir::new(base)
        .min_depth(1)
        .max_depth(depth)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| FileId::of(entry.path()) == Some(file_id))
        .map(walkdir::DirEntry::into_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mint_and_resolve_unchanged() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("a");
        std::fs::create_dir(&dir).unwrap();

        let token = Bookmark::mint(dir.to_str().unwrap(), AccessMode::ReadWrite).unwrap();
        assert_eq!(&token.as_bytes()[..4], b"DSBM");
        let resolved = token.resolve(DEFAULT_SEARCH_DEPTH).unwrap();
        assert_eq!(resolved.path, dir.canonicalize().unwrap());
        assert!(!resolved.stale);
        assert_eq!(resolved.mode, AccessMode::ReadWrite);
    }

    #[test]
    fn test_mint_from_file_url() {
        let temp = TempDir::new().unwrap();
        let url = Url::from_directory_path(temp.path()).unwrap();
        let token = Bookmark::mint(url.as_str(), AccessMode::ReadOnly).unwrap();
        assert_eq!(
            token.resolve(1).unwrap().path,
            temp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_mint_rejects_relative_and_missing() {
        assert!(matches!(
            Bookmark::mint("relative/dir", AccessMode::ReadOnly),
            Err(BrokerError::InvalidPath(_))
        ));
        assert!(matches!(
            Bookmark::mint("", AccessMode::ReadOnly),
            Err(BrokerError::InvalidPath(_))
        ));
        assert!(matches!(
            Bookmark::mint("/definitely/not/here/drivesync", AccessMode::ReadOnly),
            Err(BrokerError::BookmarkFailed { .. })
        ));
    }

    #[test]
    fn test_corrupt_token_is_unreadable() {
        let temp = TempDir::new().unwrap();
        let token = Bookmark::mint(temp.path().to_str().unwrap(), AccessMode::ReadOnly).unwrap();
        let mut bytes = token.into_bytes();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x20;
        assert!(matches!(
            Bookmark::from_bytes(bytes).resolve(1),
            Err(BrokerError::Unreadable(_))
        ));
        assert!(matches!(
            Bookmark::from_bytes(b"garbage".to_vec()).resolve(1),
            Err(BrokerError::Unreadable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_follows_renamed_parent() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("A");
        std::fs::create_dir_all(a.join("B")).unwrap();
        let token = Bookmark::mint(a.join("B").to_str().unwrap(), AccessMode::ReadOnly).unwrap();

        std::fs::rename(&a, temp.path().join("A2")).unwrap();
        let resolved = token.resolve(DEFAULT_SEARCH_DEPTH).unwrap();
        assert!(resolved.stale);
        assert_eq!(
            resolved.path,
            temp.path().canonicalize().unwrap().join("A2").join("B")
        );
    }

    #[test]
    fn test_deleted_referent_is_unreadable() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("gone");
        std::fs::create_dir(&dir).unwrap();
        let token = Bookmark::mint(dir.to_str().unwrap(), AccessMode::ReadOnly).unwrap();
        std::fs::remove_dir(&dir).unwrap();
        assert!(matches!(
            token.resolve(DEFAULT_SEARCH_DEPTH),
            Err(BrokerError::Unreadable(_))
        ));
    }

    #[test]
    fn test_base64_round_trip_and_digest() {
        let temp = TempDir::new().unwrap();
        let token = Bookmark::mint(temp.path().to_str().unwrap(), AccessMode::ReadOnly).unwrap();
        let decoded = Bookmark::from_base64(&token.to_base64()).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.digest(), token.digest());
    }
}
