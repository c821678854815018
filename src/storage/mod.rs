//! Blob store path resolution. Every path handed out by this module is
//! guaranteed to live inside the configured root directory.

mod error;

pub use error::StorageError;

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resolves place directories and photo paths under a single root.
///
/// Defense in depth: file names are sanitized component-wise, and the final
/// absolute path is additionally checked for root containment. Either check
/// alone would suffice; both are intentional.
#[derive(Debug, Clone)]
pub struct PhotoStorage {
    root: PathBuf,
}

impl PhotoStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all blobs for one place.
    pub fn place_dir(&self, place_id: i64) -> Result<PathBuf, StorageError> {
        if place_id <= 0 {
            return Err(StorageError::InvalidId(place_id));
        }
        Ok(self.root.join(place_id.to_string()))
    }

    /// Full path for a named file within a place directory.
    pub fn photo_path(&self, place_id: i64, file_name: &str) -> Result<PathBuf, StorageError> {
        sanitize_file_name(file_name)?;
        let candidate = self.place_dir(place_id)?.join(file_name);
        self.ensure_contained(&candidate)?;
        Ok(candidate)
    }

    /// Create the place directory if it does not already exist.
    pub fn create_place_dir(&self, place_id: i64) -> Result<PathBuf, StorageError> {
        let dir = self.place_dir(place_id)?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Recursively delete a place directory. Missing directories are not an
    /// error.
    pub fn remove_place_dir(&self, place_id: i64) -> Result<(), StorageError> {
        let dir = self.place_dir(place_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("removed place directory {:?}", dir);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Final-path containment check: the normalized candidate must have the
    /// root as a strict prefix.
    fn ensure_contained(&self, candidate: &Path) -> Result<(), StorageError> {
        let root = std::path::absolute(&self.root)?;
        let candidate_abs = std::path::absolute(candidate)?;
        if candidate_abs.starts_with(&root) && candidate_abs != root {
            Ok(())
        } else {
            warn!(
                "path {:?} escapes storage root {:?}, refusing",
                candidate, self.root
            );
            Err(StorageError::AccessDenied(candidate.to_path_buf()))
        }
    }
}

/// Reject file names that could escape their directory. Violations are logged
/// as possible traversal attempts.
pub fn sanitize_file_name(name: &str) -> Result<(), StorageError> {
    let reject = |reason: &str| {
        warn!(
            "rejecting file name {:?} ({}), possible traversal attempt",
            name, reason
        );
        Err(StorageError::InvalidFileName(name.to_string()))
    };

    if name.is_empty() {
        return reject("empty");
    }
    if name.len() > 255 {
        return reject("too long");
    }
    if name.contains("..") {
        return reject("parent reference");
    }
    if name.contains('/') || name.contains('\\') {
        return reject("path separator");
    }
    if name.contains(':') {
        return reject("drive marker");
    }
    if name.starts_with('.') {
        return reject("leading dot");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, PhotoStorage) {
        let dir = TempDir::new().unwrap();
        let storage = PhotoStorage::new(dir.path());
        (dir, storage)
    }

    #[test]
    fn test_place_dir_rejects_nonpositive_ids() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.place_dir(0),
            Err(StorageError::InvalidId(0))
        ));
        assert!(matches!(
            storage.place_dir(-3),
            Err(StorageError::InvalidId(-3))
        ));
    }

    #[test]
    fn test_photo_path_within_root() {
        let (dir, storage) = storage();
        let path = storage.photo_path(42, "abc123.jpg").unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.ends_with("42/abc123.jpg"));
    }

    #[test]
    fn test_photo_path_rejects_traversal() {
        let (_dir, storage) = storage();
        for bad in [
            "../../etc/passwd",
            "a/b.jpg",
            "a\\b.jpg",
            "c:file.jpg",
            ".hidden",
            "",
            "..",
        ] {
            assert!(
                matches!(
                    storage.photo_path(1, bad),
                    Err(StorageError::InvalidFileName(_))
                ),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_file_name_length_limit() {
        let long = "a".repeat(256);
        assert!(sanitize_file_name(&long).is_err());
        let ok = "a".repeat(255);
        assert!(sanitize_file_name(&ok).is_ok());
    }

    #[test]
    fn test_create_and_remove_place_dir_idempotent() {
        let (_dir, storage) = storage();
        let created = storage.create_place_dir(7).unwrap();
        assert!(created.is_dir());
        // Creating again is fine.
        storage.create_place_dir(7).unwrap();
        storage.remove_place_dir(7).unwrap();
        assert!(!created.exists());
        // Removing again is fine too.
        storage.remove_place_dir(7).unwrap();
    }
}
