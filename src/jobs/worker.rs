use super::{Job, JobQueue};
use crate::JobConfig;
use crate::db::{Database, ThumbnailStatus};
use crate::storage::PhotoStorage;
use crate::thumbnails::ThumbnailEngine;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Drains the job queue. Individual job failures are contained; the worker
/// itself never exits on error, only when every queue sender is gone.
///
/// The queue reference is weak so the worker never keeps its own channel
/// open: once every other holder drops the queue, the worker drains the
/// backlog and exits.
pub struct JobWorker {
    db: Arc<Database>,
    storage: PhotoStorage,
    engine: ThumbnailEngine,
    queue: Weak<JobQueue>,
    config: JobConfig,
}

impl JobWorker {
    pub fn new(
        db: Arc<Database>,
        storage: PhotoStorage,
        engine: ThumbnailEngine,
        queue: Arc<JobQueue>,
        config: JobConfig,
    ) -> Self {
        Self {
            db,
            storage,
            engine,
            queue: Arc::downgrade(&queue),
            config,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<Job>) {
        info!("job worker started");
        while let Some(job) = rx.recv().await {
            match job {
                Job::Thumbnail {
                    photo_id,
                    place_id,
                    file_name,
                } => self.thumbnail_job(photo_id, place_id, &file_name).await,
                Job::Preview {
                    photo_id,
                    place_id,
                    file_name,
                } => self.preview_job(photo_id, place_id, &file_name).await,
            }
        }
        info!("job queue closed, worker exiting");
    }

    /// Generate thumbnails for one photo, with exponential capped backoff.
    /// `failed` is only set once the whole attempt budget is spent.
    async fn thumbnail_job(&self, photo_id: i64, place_id: i64, file_name: &str) {
        // The photo may have been deleted before the job ran. That cancels
        // the job for good; it is not a failure.
        match self.db.get_photo(photo_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("photo {} is gone, thumbnail job cancelled", photo_id);
                return;
            }
            Err(e) => {
                error!("could not look up photo {}: {}", photo_id, e);
                return;
            }
        }

        match self.db.mark_processing(photo_id) {
            Ok(true) => debug!("photo {} entered processing", photo_id),
            Ok(false) => {}
            Err(e) => warn!("could not mark photo {} as processing: {}", photo_id, e),
        }

        let dir = match self.storage.place_dir(place_id) {
            Ok(dir) => dir,
            Err(e) => {
                error!("unresolvable place directory for photo {}: {}", photo_id, e);
                self.set_status(photo_id, ThumbnailStatus::Failed);
                return;
            }
        };
        let source = dir.join(file_name);

        let attempts = self.config.attempts.max(1);
        for attempt in 1..=attempts {
            match self.engine.generate(&source, file_name, &dir).await {
                Ok(_) => {
                    self.set_status(photo_id, ThumbnailStatus::Completed);
                    debug!("thumbnails for photo {} completed", photo_id);

                    // Companion job. Its failure never surfaces here.
                    let preview = Job::Preview {
                        photo_id,
                        place_id,
                        file_name: file_name.to_string(),
                    };
                    match self.queue.upgrade() {
                        Some(queue) => {
                            if let Err(e) = queue.enqueue(preview) {
                                warn!(
                                    "could not enqueue preview job for photo {}: {}",
                                    photo_id, e
                                );
                            }
                        }
                        None => debug!(
                            "queue dropped, skipping preview for photo {}",
                            photo_id
                        ),
                    }
                    return;
                }
                Err(e) => {
                    // Deleted mid-flight is a cancellation, not a failure.
                    if matches!(self.db.get_photo(photo_id), Ok(None)) {
                        info!("photo {} deleted mid-job, cancelled", photo_id);
                        return;
                    }
                    warn!(
                        "thumbnail generation for photo {} failed (attempt {}/{}): {}",
                        photo_id, attempt, attempts, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        error!(
            "thumbnails for photo {} failed permanently after {} attempts",
            photo_id, attempts
        );
        self.set_status(photo_id, ThumbnailStatus::Failed);
    }

    /// The social-preview companion job. Non-fatal by design: any failure is
    /// logged and swallowed.
    async fn preview_job(&self, photo_id: i64, place_id: i64, file_name: &str) {
        match self.db.get_photo(photo_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("photo {} is gone, preview job cancelled", photo_id);
                return;
            }
            Err(e) => {
                error!("could not look up photo {}: {}", photo_id, e);
                return;
            }
        }

        let title = self
            .db
            .get_place(place_id)
            .ok()
            .flatten()
            .map(|p| p.name)
            .unwrap_or_default();

        let dir = match self.storage.place_dir(place_id) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("unresolvable place directory for preview {}: {}", photo_id, e);
                return;
            }
        };
        let source = dir.join(file_name);

        if let Err(e) = self
            .engine
            .generate_preview(&source, file_name, &dir, &title)
            .await
        {
            warn!("preview generation for photo {} failed: {}", photo_id, e);
        } else {
            debug!("preview for photo {} written", photo_id);
        }
    }

    fn set_status(&self, photo_id: i64, status: ThumbnailStatus) {
        if let Err(e) = self.db.set_thumbnail_status(photo_id, status) {
            error!(
                "could not set thumbnail status {:?} for photo {}: {}",
                status, photo_id, e
            );
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = (attempt - 1).min(16);
        let ms = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
