//! The upload pipeline: validation, blob write, atomic sequence insert, and
//! background job enqueue, with per-file failure isolation.

mod error;

pub use error::UploadError;

use crate::db::Database;
use crate::jobs::{Job, JobQueue};
use crate::storage::PhotoStorage;
use crate::thumbnails::ThumbnailEngine;
use crate::validation::{Upload, ValidatedFile, Validator};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct UploadOutcome {
    pub uploaded: usize,
    /// Per-file error descriptions for the files that did not make it.
    pub failures: Vec<String>,
}

pub struct UploadPipeline {
    db: Arc<Database>,
    storage: PhotoStorage,
    validator: Validator,
    engine: ThumbnailEngine,
    queue: Arc<JobQueue>,
}

impl UploadPipeline {
    pub fn new(
        db: Arc<Database>,
        storage: PhotoStorage,
        validator: Validator,
        engine: ThumbnailEngine,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            db,
            storage,
            validator,
            engine,
            queue,
        }
    }

    /// Upload a batch of files to a place.
    ///
    /// One file's failure does not abort the others; the call succeeds if at
    /// least one file made it, carrying the rest as failure strings. Only a
    /// batch with zero survivors is an error, and it reports every failure,
    /// not just the first.
    pub async fn upload_photos(
        &self,
        place_id: i64,
        files: Vec<Upload>,
    ) -> Result<UploadOutcome, UploadError> {
        let validated = self.validator.validate_batch(&files)?;

        if !self.db.place_exists(place_id)? {
            return Err(UploadError::PlaceNotFound(place_id));
        }
        self.storage.create_place_dir(place_id)?;

        let mut uploaded = 0;
        let mut failures = Vec::new();
        for (upload, file) in files.into_iter().zip(validated) {
            let original_name = upload.file_name.clone();
            match self.store_one(place_id, upload, file).await {
                Ok(()) => uploaded += 1,
                Err(e) => {
                    warn!("upload of {:?} failed: {}", original_name, e);
                    failures.push(format!("{}: {}", original_name, e));
                }
            }
        }

        if uploaded == 0 && !failures.is_empty() {
            return Err(UploadError::AllFailed {
                count: failures.len(),
                summary: failures.join("; "),
            });
        }

        info!(
            "uploaded {} photo(s) to place {} ({} failed)",
            uploaded,
            place_id,
            failures.len()
        );
        Ok(UploadOutcome { uploaded, failures })
    }

    /// Store a single validated file: blob write, atomic row insert, job
    /// enqueue. If the insert fails after the blob landed, the blob and any
    /// derived leftovers are removed before the error propagates.
    async fn store_one(
        &self,
        place_id: i64,
        upload: Upload,
        file: ValidatedFile,
    ) -> Result<(), UploadError> {
        // Fresh storage name per upload; never reused, collision-free by
        // construction.
        let file_name = format!("{}.{}", uuid::Uuid::new_v4().simple(), file.kind.extension());
        let dest = self.storage.photo_path(place_id, &file_name)?;

        tokio::fs::write(&dest, &upload.bytes).await?;

        match self
            .db
            .insert_photo(place_id, &file_name, (file.width, file.height))
            .await
        {
            Ok((photo_id, photo_num)) => {
                info!(
                    "stored {:?} as photo {} (#{} in place {})",
                    upload.file_name, photo_id, photo_num, place_id
                );
                let job = Job::Thumbnail {
                    photo_id,
                    place_id,
                    file_name,
                };
                // Best-effort: on enqueue failure the row stays pending and
                // the retry sweep picks it up later.
                if let Err(e) = self.queue.enqueue(job) {
                    warn!(
                        "could not enqueue thumbnail job for photo {}: {}",
                        photo_id, e
                    );
                }
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&dest).await {
                    warn!("could not remove blob after failed insert: {}", cleanup);
                }
                if let Ok(dir) = self.storage.place_dir(place_id) {
                    self.engine.delete_artifacts(&dir, &file_name);
                }
                Err(e.into())
            }
        }
    }

    /// Delete one photo: row first (survivors renumber atomically), then the
    /// blob and its derived artifacts. Blob removal failures are logged only;
    /// the reconciler is the safety net.
    pub async fn delete_photo(&self, place_id: i64, photo_num: u32) -> Result<(), UploadError> {
        let photo = self.db.delete_photo(place_id, photo_num)?;
        let dir = self.storage.place_dir(place_id)?;

        match tokio::fs::remove_file(dir.join(&photo.file_name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove blob {:?}: {}", photo.file_name, e),
        }
        self.engine.delete_artifacts(&dir, &photo.file_name);
        Ok(())
    }

    /// Delete a place: cascading row delete plus blob-directory removal.
    pub fn delete_place(&self, place_id: i64) -> Result<(), UploadError> {
        self.db.delete_place(place_id)?;
        self.storage.remove_place_dir(place_id)?;
        Ok(())
    }

    /// Operational sweep: re-enqueue thumbnail work for every photo not
    /// marked completed. Covers lost enqueues and workers that died with
    /// photos stuck in `processing`.
    pub fn retry_stuck_thumbnails(&self) -> Result<usize, UploadError> {
        let mut enqueued = 0;
        for photo in self.db.photos_needing_thumbnails()? {
            self.db.reset_thumbnail_status(photo.id)?;
            match self.queue.enqueue(Job::Thumbnail {
                photo_id: photo.id,
                place_id: photo.place_id,
                file_name: photo.file_name.clone(),
            }) {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(e) => warn!("could not re-enqueue photo {}: {}", photo.id, e),
            }
        }
        if enqueued > 0 {
            info!("re-enqueued {} stuck thumbnail job(s)", enqueued);
        }
        Ok(enqueued)
    }
}
