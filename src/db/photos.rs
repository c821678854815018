//! Photo rows and the dense per-place `photo_num` sequence.
//!
//! Appends rely on a single atomic `INSERT ... SELECT MAX+1` statement plus
//! bounded retry on constraint collisions; delete and reorder renumber inside
//! one transaction using negative intermediate values so the
//! `(place_id, photo_num)` unique constraint never fires mid-update.

use super::{Database, DbError, error};
use crate::slug;
use rand::Rng;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{OptionalExtension, Row, params};
use std::time::Duration;
use tracing::{debug, warn};

const INSERT_ATTEMPTS: u32 = 5;
const INSERT_BACKOFF_BASE_MS: u64 = 50;
const PHOTO_SLUG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ThumbnailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailStatus::Pending => "pending",
            ThumbnailStatus::Processing => "processing",
            ThumbnailStatus::Completed => "completed",
            ThumbnailStatus::Failed => "failed",
        }
    }
}

impl FromSql for ThumbnailStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(ThumbnailStatus::Pending),
            "processing" => Ok(ThumbnailStatus::Processing),
            "completed" => Ok(ThumbnailStatus::Completed),
            "failed" => Ok(ThumbnailStatus::Failed),
            other => Err(FromSqlError::Other(
                format!("unknown thumbnail status {:?}", other).into(),
            )),
        }
    }
}

impl ToSql for ThumbnailStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub id: i64,
    pub place_id: i64,
    pub photo_num: u32,
    pub slug: String,
    pub file_name: String,
    pub is_favorite: bool,
    pub width: u32,
    pub height: u32,
    pub thumbnail_status: ThumbnailStatus,
}

const PHOTO_COLUMNS: &str =
    "id, place_id, photo_num, slug, file_name, is_favorite, width, height, thumbnail_status";

fn photo_from_row(row: &Row) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get(0)?,
        place_id: row.get(1)?,
        photo_num: row.get(2)?,
        slug: row.get(3)?,
        file_name: row.get(4)?,
        is_favorite: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        thumbnail_status: row.get(8)?,
    })
}

impl Database {
    /// Atomic append: compute the next `photo_num` and insert the row in one
    /// statement. Collisions with a concurrent writer surface as unique-
    /// constraint violations and are retried with jittered backoff, up to
    /// five attempts.
    pub async fn insert_photo(
        &self,
        place_id: i64,
        file_name: &str,
        dimensions: (u32, u32),
    ) -> Result<(i64, u32), DbError> {
        if !self.place_exists(place_id)? {
            return Err(DbError::NotFound);
        }

        let mut attempt = 1u32;
        loop {
            match self.try_insert_photo(place_id, file_name, dimensions) {
                Ok(result) => return Ok(result),
                Err(DbError::Sqlite(e)) if error::is_transient(&e) => {
                    if attempt >= INSERT_ATTEMPTS {
                        warn!(
                            "photo insert for place {} still conflicting after {} attempts",
                            place_id, attempt
                        );
                        return Err(DbError::ConcurrencyExhausted(INSERT_ATTEMPTS));
                    }
                    let delay = jittered_backoff(attempt);
                    debug!(
                        "photo insert conflict for place {} (attempt {}), retrying in {:?}: {}",
                        place_id, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_insert_photo(
        &self,
        place_id: i64,
        file_name: &str,
        (width, height): (u32, u32),
    ) -> Result<(i64, u32), DbError> {
        let conn = self.lock();

        let photo_slug = slug::unique_slug(PHOTO_SLUG_LEN, |candidate| {
            conn.query_row(
                "SELECT 1 FROM photos WHERE place_id = ? AND slug = ?",
                params![place_id, candidate],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
            .unwrap_or(false)
        });

        conn.execute(
            "INSERT INTO photos (place_id, photo_num, slug, file_name, width, height)
             SELECT ?1, COALESCE(MAX(photo_num), 0) + 1, ?2, ?3, ?4, ?5
             FROM photos WHERE place_id = ?1",
            params![place_id, photo_slug, file_name, width, height],
        )?;

        let id = conn.last_insert_rowid();
        let photo_num =
            conn.query_row("SELECT photo_num FROM photos WHERE id = ?", [id], |row| {
                row.get(0)
            })?;
        Ok((id, photo_num))
    }

    /// Delete one photo and close the gap it leaves. The shift runs in two
    /// phases through negative values so no intermediate state can collide
    /// with a surviving `photo_num`.
    pub fn delete_photo(&self, place_id: i64, photo_num: u32) -> Result<Photo, DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let photo = tx
            .query_row(
                &format!(
                    "SELECT {PHOTO_COLUMNS} FROM photos WHERE place_id = ?1 AND photo_num = ?2"
                ),
                params![place_id, photo_num],
                photo_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        tx.execute(
            "DELETE FROM photos WHERE place_id = ?1 AND photo_num = ?2",
            params![place_id, photo_num],
        )?;
        tx.execute(
            "UPDATE photos SET photo_num = -(photo_num - 1)
             WHERE place_id = ?1 AND photo_num > ?2",
            params![place_id, photo_num],
        )?;
        tx.execute(
            "UPDATE photos SET photo_num = -photo_num
             WHERE place_id = ?1 AND photo_num < 0",
            [place_id],
        )?;

        tx.commit()?;
        debug!(
            "deleted photo {} of place {}, renumbered survivors",
            photo_num, place_id
        );
        Ok(photo)
    }

    /// Apply a caller-supplied permutation of the existing `photo_num` values.
    /// The permutation must cover the current photo set exactly; otherwise the
    /// store is left untouched.
    ///
    /// Phase 1 parks every photo at the negation of its new position, phase 2
    /// flips the signs back. A single-pass update would trip the unique
    /// constraint mid-transaction.
    pub fn reorder_photos(&self, place_id: i64, order: &[u32]) -> Result<(), DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let current: Vec<u32> = {
            let mut stmt = tx.prepare(
                "SELECT photo_num FROM photos WHERE place_id = ? ORDER BY photo_num",
            )?;
            stmt.query_map([place_id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };

        let mut sorted = order.to_vec();
        sorted.sort_unstable();
        if order.len() != current.len() || sorted != current {
            return Err(DbError::InvalidPermutation);
        }

        for (position, old_num) in order.iter().enumerate() {
            tx.execute(
                "UPDATE photos SET photo_num = ?1 WHERE place_id = ?2 AND photo_num = ?3",
                params![-(position as i64 + 1), place_id, old_num],
            )?;
        }
        tx.execute(
            "UPDATE photos SET photo_num = -photo_num
             WHERE place_id = ?1 AND photo_num < 0",
            [place_id],
        )?;

        tx.commit()?;
        debug!("reordered {} photos of place {}", order.len(), place_id);
        Ok(())
    }

    /// Flag a photo as the place's favorite, clearing any previous one in the
    /// same transaction. Returns `Ok(false)` when the target does not exist.
    pub fn set_favorite(
        &self,
        place_id: i64,
        photo_num: u32,
        favorite: bool,
    ) -> Result<bool, DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM photos WHERE place_id = ?1 AND photo_num = ?2",
                params![place_id, photo_num],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Ok(false);
        }

        if favorite {
            tx.execute(
                "UPDATE photos SET is_favorite = 0 WHERE place_id = ?1 AND is_favorite = 1",
                [place_id],
            )?;
            tx.execute(
                "UPDATE photos SET is_favorite = 1 WHERE place_id = ?1 AND photo_num = ?2",
                params![place_id, photo_num],
            )?;
        } else {
            tx.execute(
                "UPDATE photos SET is_favorite = 0 WHERE place_id = ?1 AND photo_num = ?2",
                params![place_id, photo_num],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    pub fn get_photo(&self, id: i64) -> Result<Option<Photo>, DbError> {
        let conn = self.lock();
        let photo = conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?"),
                [id],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    pub fn photos_for_place(&self, place_id: i64) -> Result<Vec<Photo>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photos WHERE place_id = ? ORDER BY photo_num"
        ))?;
        let photos = stmt
            .query_map([place_id], photo_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    /// Primary blob names for a place, for the reconciler's expected set.
    pub fn file_names_for_place(&self, place_id: i64) -> Result<Vec<String>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT file_name FROM photos WHERE place_id = ?")?;
        let names = stmt
            .query_map([place_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// First-attempt marker: flips `pending` to `processing` exactly once.
    /// Returns whether this call made the transition.
    pub fn mark_processing(&self, photo_id: i64) -> Result<bool, DbError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE photos SET thumbnail_status = 'processing'
             WHERE id = ? AND thumbnail_status = 'pending'",
            [photo_id],
        )?;
        Ok(updated > 0)
    }

    pub fn set_thumbnail_status(
        &self,
        photo_id: i64,
        status: ThumbnailStatus,
    ) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE photos SET thumbnail_status = ?1 WHERE id = ?2",
            params![status, photo_id],
        )?;
        Ok(())
    }

    /// Put a stuck photo back to `pending` so the sweep can re-enqueue it.
    pub fn reset_thumbnail_status(&self, photo_id: i64) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE photos SET thumbnail_status = 'pending'
             WHERE id = ? AND thumbnail_status IN ('processing', 'failed')",
            [photo_id],
        )?;
        Ok(())
    }

    /// Photos whose derived artifacts are not known to be complete.
    pub fn photos_needing_thumbnails(&self) -> Result<Vec<Photo>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photos WHERE thumbnail_status != 'completed'
             ORDER BY place_id, photo_num"
        ))?;
        let photos = stmt
            .query_map([], photo_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }
}

fn jittered_backoff(attempt: u32) -> Duration {
    let base = INSERT_BACKOFF_BASE_MS * attempt as u64;
    let jitter = rand::rng().random_range(0..INSERT_BACKOFF_BASE_MS);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewPlace;

    fn db_with_place() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let place = db
            .create_place(&NewPlace {
                name: "Test".to_string(),
                ..Default::default()
            })
            .unwrap();
        (db, place.id)
    }

    async fn add_photos(db: &Database, place_id: i64, count: u32) {
        for i in 0..count {
            db.insert_photo(place_id, &format!("f{i}.jpg"), (800, 600))
                .await
                .unwrap();
        }
    }

    fn nums(db: &Database, place_id: i64) -> Vec<u32> {
        db.photos_for_place(place_id)
            .unwrap()
            .iter()
            .map(|p| p.photo_num)
            .collect()
    }

    #[tokio::test]
    async fn test_insert_assigns_dense_sequence() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 4).await;
        assert_eq!(nums(&db, place_id), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_insert_into_missing_place_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let err = db.insert_photo(99, "f.jpg", (1, 1)).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_renumbers_survivors() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 5).await;

        let deleted = db.delete_photo(place_id, 2).unwrap();
        assert_eq!(deleted.file_name, "f1.jpg");
        assert_eq!(nums(&db, place_id), vec![1, 2, 3, 4]);

        // Former #3 is the new #2.
        let photos = db.photos_for_place(place_id).unwrap();
        assert_eq!(photos[1].file_name, "f2.jpg");
    }

    #[tokio::test]
    async fn test_delete_missing_photo_is_not_found() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 1).await;
        assert!(matches!(
            db.delete_photo(place_id, 7),
            Err(DbError::NotFound)
        ));
        // The store is unchanged.
        assert_eq!(nums(&db, place_id), vec![1]);
    }

    #[tokio::test]
    async fn test_reorder_applies_permutation() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 3).await;

        // New order: old #3 first, then #1, then #2.
        db.reorder_photos(place_id, &[3, 1, 2]).unwrap();
        let photos = db.photos_for_place(place_id).unwrap();
        let files: Vec<_> = photos.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(files, vec!["f2.jpg", "f0.jpg", "f1.jpg"]);
        assert_eq!(nums(&db, place_id), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reorder_rejects_bad_permutations_untouched() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 3).await;
        let before = db.photos_for_place(place_id).unwrap();

        for bad in [&[1u32, 2][..], &[1, 2, 2], &[1, 2, 4], &[1, 2, 3, 4]] {
            assert!(matches!(
                db.reorder_photos(place_id, bad),
                Err(DbError::InvalidPermutation)
            ));
        }
        assert_eq!(db.photos_for_place(place_id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_at_most_one_favorite() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 3).await;

        assert!(db.set_favorite(place_id, 1, true).unwrap());
        assert!(db.set_favorite(place_id, 3, true).unwrap());

        let favorites: Vec<_> = db
            .photos_for_place(place_id)
            .unwrap()
            .into_iter()
            .filter(|p| p.is_favorite)
            .collect();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].photo_num, 3);

        assert!(db.set_favorite(place_id, 3, false).unwrap());
        assert!(
            db.photos_for_place(place_id)
                .unwrap()
                .iter()
                .all(|p| !p.is_favorite)
        );

        // Missing target is reported, not retried.
        assert!(!db.set_favorite(place_id, 42, true).unwrap());
    }

    #[tokio::test]
    async fn test_thumbnail_status_machine() {
        let (db, place_id) = db_with_place();
        let (photo_id, _) = db.insert_photo(place_id, "f.jpg", (1, 1)).await.unwrap();

        // pending -> processing happens exactly once.
        assert!(db.mark_processing(photo_id).unwrap());
        assert!(!db.mark_processing(photo_id).unwrap());

        db.set_thumbnail_status(photo_id, ThumbnailStatus::Failed)
            .unwrap();
        let photo = db.get_photo(photo_id).unwrap().unwrap();
        assert_eq!(photo.thumbnail_status, ThumbnailStatus::Failed);

        // The sweep resets failed photos to pending.
        db.reset_thumbnail_status(photo_id).unwrap();
        let photo = db.get_photo(photo_id).unwrap().unwrap();
        assert_eq!(photo.thumbnail_status, ThumbnailStatus::Pending);
        assert_eq!(db.photos_needing_thumbnails().unwrap().len(), 1);

        db.set_thumbnail_status(photo_id, ThumbnailStatus::Completed)
            .unwrap();
        assert!(db.photos_needing_thumbnails().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_place_delete_cascades_to_photos() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 2).await;
        db.delete_place(place_id).unwrap();
        assert!(db.photos_for_place(place_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_photo_slugs_unique_within_place() {
        let (db, place_id) = db_with_place();
        add_photos(&db, place_id, 10).await;
        let mut slugs: Vec<_> = db
            .photos_for_place(place_id)
            .unwrap()
            .into_iter()
            .map(|p| p.slug)
            .collect();
        slugs.sort();
        slugs.dedup();
        assert_eq!(slugs.len(), 10);
    }
}
