//! Derived-artifact generation. Every output is written to a temp path and
//! renamed into place so a concurrent reader never sees a partial file.

mod error;
mod lock;
mod preview;

pub use error::ThumbnailError;
pub use lock::SourceLock;
pub use preview::{PREVIEW_HEIGHT, PREVIEW_WIDTH, compose_preview};

use crate::ThumbnailConfig;
use image::{DynamicImage, imageops::FilterType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Naming pattern for in-flight writes. The reconciler sweeps abandoned ones.
pub const TEMP_PREFIX: &str = ".tmp-";
pub const LOCK_SUFFIX: &str = ".lock";

const THUMB_EXT: &str = "jpg";
const PREVIEW_SUFFIX: &str = "-og";

#[derive(Debug, Clone, Copy)]
pub struct Variant {
    pub name: &'static str,
    pub suffix: &'static str,
    pub max_dim: u32,
}

pub const VARIANTS: [Variant; 3] = [
    Variant {
        name: "thumb",
        suffix: "-thumb",
        max_dim: 200,
    },
    Variant {
        name: "small",
        suffix: "-small",
        max_dim: 400,
    },
    Variant {
        name: "medium",
        suffix: "-medium",
        max_dim: 800,
    },
];

fn base_name(file_name: &str) -> &str {
    file_name
        .rsplit_once('.')
        .map(|(base, _)| base)
        .unwrap_or(file_name)
}

pub fn variant_file_name(file_name: &str, variant: &Variant) -> String {
    format!("{}{}.{}", base_name(file_name), variant.suffix, THUMB_EXT)
}

pub fn preview_file_name(file_name: &str) -> String {
    format!("{}{}.{}", base_name(file_name), PREVIEW_SUFFIX, THUMB_EXT)
}

/// Every artifact derivable from one primary blob. Deterministic, so the
/// reconciler can compute the expected file set without a side table.
pub fn derived_file_names(file_name: &str) -> Vec<String> {
    let mut names: Vec<String> = VARIANTS
        .iter()
        .map(|v| variant_file_name(file_name, v))
        .collect();
    names.push(preview_file_name(file_name));
    names
}

/// Aspect-preserving target size: the longer side clamps to `max_dim`, the
/// shorter scales proportionally, rounded to nearest. Never upscales.
pub fn scaled_dimensions(width: u32, height: u32, max_dim: u32) -> (u32, u32) {
    let longer = width.max(height);
    if longer <= max_dim {
        return (width, height);
    }
    let scale = |side: u32| -> u32 {
        let scaled = (side as u64 * max_dim as u64 + longer as u64 / 2) / longer as u64;
        (scaled as u32).max(1)
    };
    if width >= height {
        (max_dim, scale(height))
    } else {
        (scale(width), max_dim)
    }
}

#[derive(Debug, Clone)]
pub struct ThumbnailEngine {
    config: ThumbnailConfig,
}

impl ThumbnailEngine {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self { config }
    }

    /// Generate every size variant for one source image. Returns the source's
    /// intrinsic dimensions.
    ///
    /// Holds the per-source lock for the duration. If any variant fails after
    /// its retry budget, variants already written this pass are removed; a
    /// partial set never survives.
    pub async fn generate(
        &self,
        source: &Path,
        file_name: &str,
        output_dir: &Path,
    ) -> Result<(u32, u32), ThumbnailError> {
        let _lock = SourceLock::acquire(
            output_dir,
            file_name,
            Duration::from_secs(self.config.lock_timeout_secs),
        )?;

        let img = self.load_source(source).await?;
        let dimensions = (img.width(), img.height());

        let mut written: Vec<PathBuf> = Vec::new();
        for variant in &VARIANTS {
            let dest = output_dir.join(variant_file_name(file_name, variant));
            match self.generate_variant(img.clone(), *variant, dest.clone()).await {
                Ok(()) => written.push(dest),
                Err(e) => {
                    for path in &written {
                        let _ = std::fs::remove_file(path);
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            "generated {} variants for {:?} ({}x{})",
            written.len(),
            file_name,
            dimensions.0,
            dimensions.1
        );
        Ok(dimensions)
    }

    /// Compose and atomically write the social preview image.
    pub async fn generate_preview(
        &self,
        source: &Path,
        file_name: &str,
        output_dir: &Path,
        title: &str,
    ) -> Result<(), ThumbnailError> {
        let img = self.load_source(source).await?;
        let dest = output_dir.join(preview_file_name(file_name));
        let font_path = self.config.font_path.clone();
        let title = title.to_string();
        let quality = self.config.jpeg_quality;

        let budget = Duration::from_secs(self.config.variant_timeout_secs);
        run_blocking(budget, "preview", move || {
            let composed = compose_preview(&img, &title, font_path.as_deref());
            write_atomic(&dest, |tmp| save_jpeg(&composed, tmp, quality))
        })
        .await
    }

    /// Remove every derived artifact for a source. Missing files are fine.
    pub fn delete_artifacts(&self, output_dir: &Path, file_name: &str) {
        for name in derived_file_names(file_name) {
            match std::fs::remove_file(output_dir.join(&name)) {
                Ok(()) => debug!("removed derived artifact {:?}", name),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove derived artifact {:?}: {}", name, e),
            }
        }
    }

    async fn load_source(&self, source: &Path) -> Result<Arc<DynamicImage>, ThumbnailError> {
        let path = source.to_path_buf();
        let budget = Duration::from_secs(self.config.variant_timeout_secs);
        let img = run_blocking(budget, "source decode", move || {
            image::open(&path).map_err(ThumbnailError::from)
        })
        .await?;
        Ok(Arc::new(img))
    }

    async fn generate_variant(
        &self,
        img: Arc<DynamicImage>,
        variant: Variant,
        dest: PathBuf,
    ) -> Result<(), ThumbnailError> {
        let attempts = self.config.variant_attempts.max(1);
        let budget = Duration::from_secs(self.config.variant_timeout_secs);
        let mut last = String::new();

        for attempt in 1..=attempts {
            let img = img.clone();
            let dest = dest.clone();
            let quality = self.config.jpeg_quality;
            let result = run_blocking(budget, variant.name, move || {
                write_variant(&img, &variant, &dest, quality)
            })
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "attempt {}/{} for {} variant failed: {}",
                        attempt, attempts, variant.name, e
                    );
                    last = e.to_string();
                }
            }

            if attempt < attempts {
                // Linear backoff between attempts.
                tokio::time::sleep(Duration::from_millis(
                    self.config.variant_retry_delay_ms * attempt as u64,
                ))
                .await;
            }
        }

        Err(ThumbnailError::AttemptsExhausted {
            variant: variant.name,
            attempts,
            last,
        })
    }
}

/// Run CPU-bound image work off the async threads, bounded by a timeout so a
/// malformed input cannot hang a worker.
async fn run_blocking<T, F>(
    budget: Duration,
    what: &'static str,
    f: F,
) -> Result<T, ThumbnailError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ThumbnailError> + Send + 'static,
{
    match tokio::time::timeout(budget, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ThumbnailError::Task(join.to_string())),
        Err(_) => Err(ThumbnailError::Timeout(what)),
    }
}

fn write_variant(
    img: &DynamicImage,
    variant: &Variant,
    dest: &Path,
    quality: u8,
) -> Result<(), ThumbnailError> {
    let (width, height) = scaled_dimensions(img.width(), img.height(), variant.max_dim);
    let resized = img.resize_exact(width, height, FilterType::Lanczos3);
    write_atomic(dest, |tmp| save_jpeg(&resized, tmp, quality))
}

fn save_jpeg(img: &DynamicImage, path: &Path, quality: u8) -> Result<(), ThumbnailError> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, quality);
    // JPEG has no alpha channel.
    DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
    Ok(())
}

/// Write through a uniquely-named temp sibling, then rename into place.
/// Readers of `dest` never observe a partial file.
pub(crate) fn write_atomic<F>(dest: &Path, write: F) -> Result<(), ThumbnailError>
where
    F: FnOnce(&Path) -> Result<(), ThumbnailError>,
{
    let dir = dest.parent().ok_or_else(|| {
        ThumbnailError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "destination has no parent directory",
        ))
    })?;
    let tmp = dir.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4().simple()));
    match write(&tmp) {
        Ok(()) => {
            std::fs::rename(&tmp, dest)?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn engine() -> ThumbnailEngine {
        ThumbnailEngine::new(crate::Config::default().thumbnails)
    }

    fn write_test_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(width, height, Rgb([30, 90, 160]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_scaled_dimensions() {
        // Landscape: width clamps.
        assert_eq!(scaled_dimensions(1600, 1200, 800), (800, 600));
        // Portrait: height clamps.
        assert_eq!(scaled_dimensions(600, 1200, 400), (200, 400));
        // Rounding to nearest.
        assert_eq!(scaled_dimensions(1000, 333, 200), (200, 67));
        // No upscaling.
        assert_eq!(scaled_dimensions(100, 80, 200), (100, 80));
        // Degenerate aspect still yields a valid size.
        assert_eq!(scaled_dimensions(10_000, 1, 200), (200, 1));
    }

    #[test]
    fn test_derived_file_names_are_deterministic() {
        let names = derived_file_names("abc123.png");
        assert_eq!(
            names,
            vec![
                "abc123-thumb.jpg",
                "abc123-small.jpg",
                "abc123-medium.jpg",
                "abc123-og.jpg"
            ]
        );
    }

    #[tokio::test]
    async fn test_generate_writes_all_variants_atomically() {
        let dir = TempDir::new().unwrap();
        let source = write_test_image(dir.path(), "photo.png", 1600, 1200);

        let dims = engine()
            .generate(&source, "photo.png", dir.path())
            .await
            .unwrap();
        assert_eq!(dims, (1600, 1200));

        for variant in &VARIANTS {
            let path = dir.path().join(variant_file_name("photo.png", variant));
            let meta = std::fs::metadata(&path).unwrap();
            assert!(meta.len() > 0, "variant {:?} is empty", path);
        }

        // No temp files or locks left behind.
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            assert!(!name.starts_with(TEMP_PREFIX), "leftover temp {:?}", name);
            assert!(!name.ends_with(LOCK_SUFFIX), "leftover lock {:?}", name);
        }
    }

    #[tokio::test]
    async fn test_generate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = write_test_image(dir.path(), "photo.png", 900, 600);
        let engine = engine();

        let first = engine.generate(&source, "photo.png", dir.path()).await.unwrap();
        let second = engine.generate(&source, "photo.png", dir.path()).await.unwrap();
        assert_eq!(first, second);

        for variant in &VARIANTS {
            let path = dir.path().join(variant_file_name("photo.png", variant));
            let (w, h) = crate::validation::probe_dimensions(&std::fs::read(&path).unwrap())
                .unwrap();
            assert_eq!((w, h), scaled_dimensions(900, 600, variant.max_dim));
        }
    }

    #[tokio::test]
    async fn test_generate_fails_on_unreadable_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.png");
        std::fs::write(&source, b"not an image").unwrap();

        let result = engine().generate(&source, "broken.png", dir.path()).await;
        assert!(result.is_err());
        // Nothing half-written survives.
        for variant in &VARIANTS {
            assert!(!dir.path().join(variant_file_name("broken.png", variant)).exists());
        }
    }

    #[tokio::test]
    async fn test_generate_respects_existing_lock() {
        let dir = TempDir::new().unwrap();
        let source = write_test_image(dir.path(), "photo.png", 400, 300);
        let _held = SourceLock::acquire(dir.path(), "photo.png", Duration::from_secs(3600))
            .unwrap();

        let result = engine().generate(&source, "photo.png", dir.path()).await;
        assert!(matches!(result, Err(ThumbnailError::Locked(_))));
    }

    #[tokio::test]
    async fn test_preview_written_without_font() {
        let dir = TempDir::new().unwrap();
        let source = write_test_image(dir.path(), "photo.png", 1600, 900);

        engine()
            .generate_preview(&source, "photo.png", dir.path(), "Lofoten")
            .await
            .unwrap();

        let bytes = std::fs::read(dir.path().join("photo-og.jpg")).unwrap();
        let dims = crate::validation::probe_dimensions(&bytes).unwrap();
        assert_eq!(dims, (PREVIEW_WIDTH, PREVIEW_HEIGHT));
    }

    #[tokio::test]
    async fn test_delete_artifacts_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = write_test_image(dir.path(), "photo.png", 400, 300);
        let engine = engine();
        engine.generate(&source, "photo.png", dir.path()).await.unwrap();

        engine.delete_artifacts(dir.path(), "photo.png");
        for variant in &VARIANTS {
            assert!(!dir.path().join(variant_file_name("photo.png", variant)).exists());
        }
        // Second delete is a no-op.
        engine.delete_artifacts(dir.path(), "photo.png");
    }
}
