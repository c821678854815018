//! Per-source lock files. The only cross-process mutual exclusion in the
//! system; everything else rides on database transactions.

use super::{LOCK_SUFFIX, TEMP_PREFIX, ThumbnailError};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Held while one worker regenerates the derived artifacts of one source
/// image. Released on drop.
pub struct SourceLock {
    path: PathBuf,
}

impl SourceLock {
    /// Acquire the lock via exclusive create. A lock older than `stale_after`
    /// is treated as abandoned by a crashed worker and is replaced atomically
    /// (temp file then rename) so that two stale-detectors cannot both win by
    /// deleting and recreating.
    pub fn acquire(
        dir: &Path,
        file_name: &str,
        stale_after: Duration,
    ) -> Result<Self, ThumbnailError> {
        let path = dir.join(format!("{file_name}{LOCK_SUFFIX}"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_age(&path).is_some_and(|age| age >= stale_after) {
                    warn!("replacing stale lock {:?}", path);
                    let tmp = dir.join(format!(
                        "{TEMP_PREFIX}{}{LOCK_SUFFIX}",
                        uuid::Uuid::new_v4().simple()
                    ));
                    std::fs::write(&tmp, [])?;
                    std::fs::rename(&tmp, &path)?;
                    Ok(Self { path })
                } else {
                    debug!("source already locked: {:?}", path);
                    Err(ThumbnailError::Locked(path))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified.elapsed().ok()
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
