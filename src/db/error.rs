use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found")]
    NotFound,

    #[error("photo sequence contention not resolved after {0} attempts")]
    ConcurrencyExhausted(u32),

    #[error("reorder permutation does not match the current photo set")]
    InvalidPermutation,
}

/// A transient conflict worth retrying: a unique-constraint collision from two
/// writers computing the same next photo_num, or a busy/locked database.
/// Foreign-key violations are deliberately excluded; those are not transient.
pub(crate) fn is_transient(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                | rusqlite::ffi::SQLITE_BUSY
                | rusqlite::ffi::SQLITE_LOCKED
        ),
        _ => false,
    }
}
