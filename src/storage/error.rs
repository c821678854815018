use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid place id: {0}")]
    InvalidId(i64),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("path escapes storage root: {0:?}")]
    AccessDenied(PathBuf),
}
