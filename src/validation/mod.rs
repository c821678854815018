//! Upload inspection. Every check here is pure over the upload's bytes; no
//! blob is written until validation has passed.

mod error;

pub use error::{BatchError, ValidationError};

use crate::UploadConfig;
use crate::storage;
use std::io::Cursor;
use tracing::debug;

/// An uploaded file as handed over by the controller layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    /// Content type declared by the client, if any. Browsers may omit it.
    pub declared_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    WebP,
    Gif,
}

impl ImageKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::WebP => "webp",
            ImageKind::Gif => "gif",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::WebP => "image/webp",
            ImageKind::Gif => "image/gif",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "JPEG",
            ImageKind::Png => "PNG",
            ImageKind::WebP => "WebP",
            ImageKind::Gif => "GIF",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "png" => Some(ImageKind::Png),
            "webp" => Some(ImageKind::WebP),
            "gif" => Some(ImageKind::Gif),
            _ => None,
        }
    }
}

/// Outcome of a successful validation: the detected format plus the header
/// dimensions, read once at ingest.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedFile {
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct Validator {
    config: UploadConfig,
}

impl Validator {
    pub fn new(config: UploadConfig) -> Self {
        Self { config }
    }

    /// Run every check against a single upload, short-circuiting on the first
    /// failure. Returns the detected format on success.
    pub fn validate(&self, upload: &Upload) -> Result<ValidatedFile, ValidationError> {
        // Filename sanity. Same rules the storage layer enforces.
        storage::sanitize_file_name(&upload.file_name)
            .map_err(|_| ValidationError::InvalidFileName(upload.file_name.clone()))?;

        // Size bounds.
        let size = upload.bytes.len() as u64;
        if size == 0 {
            return Err(ValidationError::EmptyFile);
        }
        if size > self.config.max_file_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.config.max_file_bytes,
            });
        }

        // Extension allow-list.
        let extension = upload
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("");
        let claimed = ImageKind::from_extension(extension)
            .ok_or_else(|| ValidationError::UnsupportedExtension(extension.to_string()))?;

        // Declared MIME allow-list, cross-checked against the extension.
        if let Some(declared) = upload.declared_type.as_deref() {
            if ImageKind::from_mime(declared).is_none() {
                return Err(ValidationError::UnsupportedContentType(declared.to_string()));
            }
            let expected = mime_guess::from_path(&upload.file_name).first_or_octet_stream();
            if declared != expected.essence_str() {
                return Err(ValidationError::ContentTypeMismatch {
                    declared: declared.to_string(),
                    extension: extension.to_string(),
                });
            }
        }

        // Magic-number sniff of the leading bytes.
        let sniffed = sniff_kind(&upload.bytes).ok_or(ValidationError::UnrecognizedFormat)?;
        if sniffed != claimed {
            return Err(ValidationError::FormatMismatch {
                expected: claimed.name(),
                found: sniffed.name(),
            });
        }

        // Dimension probe against the bomb ceiling. Header-only: the raster is
        // never decoded here.
        let (width, height) = probe_dimensions(&upload.bytes)?;
        if width > self.config.max_width
            || height > self.config.max_height
            || width as u64 * height as u64 > self.config.max_pixels
        {
            return Err(ValidationError::DimensionsTooLarge { width, height });
        }

        debug!(
            "validated {:?}: {} {}x{}, {} bytes",
            upload.file_name,
            sniffed.name(),
            width,
            height,
            size
        );
        Ok(ValidatedFile {
            kind: sniffed,
            width,
            height,
        })
    }

    /// Validate a whole batch, accumulating every per-file failure.
    pub fn validate_batch(&self, uploads: &[Upload]) -> Result<Vec<ValidatedFile>, BatchError> {
        if uploads.len() > self.config.max_files_per_batch {
            return Err(BatchError::TooManyFiles {
                count: uploads.len(),
                max: self.config.max_files_per_batch,
            });
        }

        let mut validated = Vec::with_capacity(uploads.len());
        let mut failures = Vec::new();
        for upload in uploads {
            match self.validate(upload) {
                Ok(file) => validated.push(file),
                Err(e) => failures.push((upload.file_name.clone(), e)),
            }
        }

        if failures.is_empty() {
            Ok(validated)
        } else {
            Err(BatchError::Files { failures })
        }
    }
}

impl ImageKind {
    fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" => Some(ImageKind::Jpeg),
            "image/png" => Some(ImageKind::Png),
            "image/webp" => Some(ImageKind::WebP),
            "image/gif" => Some(ImageKind::Gif),
            _ => None,
        }
    }
}

/// Identify the format from the first bytes of the file.
fn sniff_kind(bytes: &[u8]) -> Option<ImageKind> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageKind::Jpeg);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ImageKind::Png);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageKind::WebP);
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some(ImageKind::Gif);
    }
    None
}

/// Read declared dimensions from the image header without decoding the raster.
pub(crate) fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), ValidationError> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ValidationError::UnreadableHeader(e.to_string()))?
        .into_dimensions()
        .map_err(|e| ValidationError::UnreadableHeader(e.to_string()))
}
