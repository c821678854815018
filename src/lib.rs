use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod db;
pub mod jobs;
pub mod reconcile;
pub mod slug;
pub mod storage;
pub mod thumbnails;
pub mod upload;
pub mod validation;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub thumbnails: ThumbnailConfig,
    pub jobs: JobConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub name: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root of the blob store. Every photo path is confined to this tree.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    pub max_file_bytes: u64,
    pub max_files_per_batch: usize,
    pub max_width: u32,
    pub max_height: u32,
    /// Total-pixel ceiling, the decompression-bomb guard.
    pub max_pixels: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThumbnailConfig {
    pub jpeg_quality: u8,
    /// Per-variant generation attempts before the whole batch fails.
    pub variant_attempts: u32,
    pub variant_retry_delay_ms: u64,
    /// Budget for a single variant generation attempt.
    pub variant_timeout_secs: u64,
    /// A lock file older than this is considered abandoned.
    pub lock_timeout_secs: u64,
    /// Font used for the preview text overlay. Overlay is skipped when absent.
    #[serde(default)]
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    pub queue_capacity: usize,
    pub attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Duplicate enqueues for the same photo within this window are suppressed.
    pub dedup_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcilerConfig {
    /// None or 0 disables the periodic run; on-demand runs still work.
    pub interval_minutes: Option<u64>,
    /// Files and directories younger than this are never touched.
    pub min_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                name: "Kura".to_string(),
                log_level: "info".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("kura.db"),
            },
            storage: StorageConfig {
                root: PathBuf::from("photos"),
            },
            upload: UploadConfig {
                max_file_bytes: 25 * 1024 * 1024,
                max_files_per_batch: 20,
                max_width: 12_000,
                max_height: 12_000,
                max_pixels: 50_000_000,
            },
            thumbnails: ThumbnailConfig {
                jpeg_quality: 85,
                variant_attempts: 3,
                variant_retry_delay_ms: 250,
                variant_timeout_secs: 30,
                lock_timeout_secs: 300,
                font_path: None,
            },
            jobs: JobConfig {
                queue_capacity: 256,
                attempts: 5,
                base_backoff_ms: 500,
                max_backoff_ms: 30_000,
                dedup_window_secs: 60,
            },
            reconciler: ReconcilerConfig {
                interval_minutes: Some(60),
                min_age_secs: 3600,
            },
        }
    }
}
