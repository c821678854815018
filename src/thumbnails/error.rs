use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("source is locked by another worker: {0:?}")]
    Locked(PathBuf),

    #[error("timed out generating {0} variant")]
    Timeout(&'static str),

    #[error("gave up on {variant} variant after {attempts} attempts: {last}")]
    AttemptsExhausted {
        variant: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("could not load overlay font: {0}")]
    Font(String),

    #[error("background image task failed: {0}")]
    Task(String),
}
