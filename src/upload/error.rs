use crate::db::DbError;
use crate::storage::StorageError;
use crate::validation::BatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(#[from] BatchError),

    #[error("place {0} not found")]
    PlaceNotFound(i64),

    #[error("all {count} file(s) failed: {summary}")]
    AllFailed { count: usize, summary: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
