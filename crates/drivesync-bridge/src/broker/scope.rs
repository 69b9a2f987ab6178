//! The OS-level access right behind a session.

use super::token::AccessMode;
use std::io;
use std::path::Path;
use tracing::trace;

/// Grants and withdraws the underlying right to touch a location.
///
/// The broker calls `acquire` once when the first session for a location starts and
/// `release` once when the last one ends.
pub trait ScopeProvider: Send + Sync {
    fn acquire(&self, path: &Path, mode: AccessMode) -> io::Result<()>;

    fn release(&self, path: &Path);
}

/// Grants access when the process can already read (and, for read-write, write) the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsScopeProvider;

impl ScopeProvider for FsScopeProvider {
    fn acquire(&self, path: &Path, mode: AccessMode) -> io::Result<()> {
        let metadata = std::fs::metadata(path)?;
        if metadata.is_dir() {
            std::fs::read_dir(path)?;
        } else {
            std::fs::File::open(path)?;
        }
        if mode == AccessMode::ReadWrite && metadata.permissions().readonly() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is read-only", path.display()),
            ));
        }
        trace!("acquired {mode} scope on {}", path.display());
        Ok(())
    }

    fn release(&self, path: &Path) {
        trace!("released scope on {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_readable_directory_granted() {
        let temp = TempDir::new().unwrap();
        assert!(FsScopeProvider.acquire(temp.path(), AccessMode::ReadWrite).is_ok());
    }

    #[test]
    fn test_missing_path_denied() {
        let temp = TempDir::new().unwrap();
        let err = FsScopeProvider
            .acquire(&temp.path().join("missing"), AccessMode::ReadOnly)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_read_only_file_denied_for_write() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("ro.txt");
        std::fs::write(&file, b"x").unwrap();
        let mut perms = std::fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&file, perms).unwrap();

        assert!(FsScopeProvider.acquire(&file, AccessMode::ReadOnly).is_ok());
        assert!(FsScopeProvider.acquire(&file, AccessMode::ReadWrite).is_err());
    }
}
