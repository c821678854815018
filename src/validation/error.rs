use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("file is empty")]
    EmptyFile,

    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("unsupported file extension: {0:?}")]
    UnsupportedExtension(String),

    #[error("declared content type {0:?} is not an accepted image type")]
    UnsupportedContentType(String),

    #[error("declared content type {declared:?} does not match extension {extension:?}")]
    ContentTypeMismatch { declared: String, extension: String },

    #[error("file content is not a recognized image format")]
    UnrecognizedFormat,

    #[error("file content is {found}, extension says {expected}")]
    FormatMismatch { expected: &'static str, found: &'static str },

    #[error("could not read image header: {0}")]
    UnreadableHeader(String),

    #[error("image is {width}x{height}, exceeds the configured ceiling")]
    DimensionsTooLarge { width: u32, height: u32 },
}

/// Aggregate failure for a batch: every failing file is reported, not just the
/// first one.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch of {count} files exceeds the limit of {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("{} file(s) failed validation: {}", failures.len(), describe(failures))]
    Files {
        failures: Vec<(String, ValidationError)>,
    },
}

fn describe(failures: &[(String, ValidationError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}
