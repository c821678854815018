use kura::Config;
use kura::db::{Database, DbError, NewPlace, ThumbnailStatus};
use kura::jobs::{JobQueue, JobWorker};
use kura::storage::PhotoStorage;
use kura::thumbnails::{self, ThumbnailEngine};
use kura::upload::UploadPipeline;
use kura::validation::{Upload, Validator};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn png_upload(name: &str, width: u32, height: u32) -> Upload {
    let img = RgbImage::from_pixel(width, height, Rgb([90, 140, 60]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    Upload {
        file_name: name.to_string(),
        declared_type: Some("image/png".to_string()),
        bytes: out.into_inner(),
    }
}

struct Harness {
    _root: TempDir,
    db: Arc<Database>,
    storage: PhotoStorage,
    pipeline: UploadPipeline,
    worker: Option<(JobWorker, tokio::sync::mpsc::Receiver<kura::jobs::Job>)>,
}

fn harness() -> Harness {
    let root = TempDir::new().unwrap();
    let config = Config::default();
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.initialize().unwrap();

    let storage = PhotoStorage::new(root.path());
    let engine = ThumbnailEngine::new(config.thumbnails.clone());
    let (queue, rx) = JobQueue::new(&config.jobs);
    let worker = JobWorker::new(
        db.clone(),
        storage.clone(),
        engine.clone(),
        queue.clone(),
        config.jobs.clone(),
    );
    let pipeline = UploadPipeline::new(
        db.clone(),
        storage.clone(),
        Validator::new(config.upload.clone()),
        engine,
        queue,
    );
    Harness {
        _root: root,
        db,
        storage,
        pipeline,
        worker: Some((worker, rx)),
    }
}

fn place(db: &Database, name: &str) -> i64 {
    db.create_place(&NewPlace {
        name: name.to_string(),
        location: "Kyoto".to_string(),
        country: "Japan".to_string(),
        ..Default::default()
    })
    .unwrap()
    .id
}

fn photo_nums(db: &Database, place_id: i64) -> Vec<u32> {
    db.photos_for_place(place_id)
        .unwrap()
        .iter()
        .map(|p| p.photo_num)
        .collect()
}

#[tokio::test]
async fn test_full_gallery_lifecycle() {
    let h = harness();
    let place_id = place(&h.db, "Autumn Leaves");

    // Three uploads take the first three sequence numbers.
    let outcome = h
        .pipeline
        .upload_photos(
            place_id,
            vec![
                png_upload("one.png", 64, 48),
                png_upload("two.png", 64, 48),
                png_upload("three.png", 64, 48),
            ],
        )
        .await
        .unwrap();
    assert_eq!(outcome.uploaded, 3);
    assert_eq!(photo_nums(&h.db, place_id), vec![1, 2, 3]);

    // Deleting the middle photo closes the gap.
    h.pipeline.delete_photo(place_id, 2).await.unwrap();
    assert_eq!(photo_nums(&h.db, place_id), vec![1, 2]);

    // Swap the remaining two.
    let before: Vec<String> = h
        .db
        .photos_for_place(place_id)
        .unwrap()
        .iter()
        .map(|p| p.file_name.clone())
        .collect();
    h.db.reorder_photos(place_id, &[2, 1]).unwrap();
    let after: Vec<String> = h
        .db
        .photos_for_place(place_id)
        .unwrap()
        .iter()
        .map(|p| p.file_name.clone())
        .collect();
    assert_eq!(after, vec![before[1].clone(), before[0].clone()]);
    assert_eq!(photo_nums(&h.db, place_id), vec![1, 2]);

    // Favoriting the second photo clears the first.
    assert!(h.db.set_favorite(place_id, 1, true).unwrap());
    assert!(h.db.set_favorite(place_id, 2, true).unwrap());
    let favorites: Vec<u32> = h
        .db
        .photos_for_place(place_id)
        .unwrap()
        .iter()
        .filter(|p| p.is_favorite)
        .map(|p| p.photo_num)
        .collect();
    assert_eq!(favorites, vec![2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_yield_contiguous_numbers() {
    const UPLOADERS: usize = 12;

    let db = Arc::new(Database::open_in_memory().unwrap());
    db.initialize().unwrap();
    let place_id = place(&db, "Race");

    let mut handles = Vec::new();
    for i in 0..UPLOADERS {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.insert_photo(place_id, &format!("f{i}.jpg"), (10, 10)).await
        }));
    }

    let mut nums = Vec::new();
    for handle in handles {
        let (_, num) = handle.await.unwrap().unwrap();
        nums.push(num);
    }
    nums.sort_unstable();
    let expected: Vec<u32> = (1..=UPLOADERS as u32).collect();
    assert_eq!(nums, expected, "every uploader got a distinct contiguous number");
}

#[tokio::test]
async fn test_reorder_rejects_stale_permutation() {
    let h = harness();
    let place_id = place(&h.db, "Stale");
    for name in ["a.png", "b.png", "c.png"] {
        h.pipeline
            .upload_photos(place_id, vec![png_upload(name, 16, 16)])
            .await
            .unwrap();
    }
    let snapshot = h.db.photos_for_place(place_id).unwrap();

    // A permutation built against a four-photo view of a three-photo place.
    let err = h.db.reorder_photos(place_id, &[4, 2, 3, 1]).unwrap_err();
    assert!(matches!(err, DbError::InvalidPermutation));
    // Nothing moved.
    assert_eq!(h.db.photos_for_place(place_id).unwrap(), snapshot);

    // Same length but wrong contents is rejected too.
    let err = h.db.reorder_photos(place_id, &[1, 2, 4]).unwrap_err();
    assert!(matches!(err, DbError::InvalidPermutation));
}

#[tokio::test]
async fn test_partial_batch_survives_bad_file() {
    let h = harness();
    let place_id = place(&h.db, "Mixed");

    // The malformed file fails validation, which rejects the whole batch
    // before any blob is written.
    let result = h
        .pipeline
        .upload_photos(
            place_id,
            vec![
                png_upload("good.png", 16, 16),
                Upload {
                    file_name: "broken.png".to_string(),
                    declared_type: None,
                    bytes: vec![0u8; 32],
                },
            ],
        )
        .await;
    assert!(result.is_err());
    assert!(h.db.photos_for_place(place_id).unwrap().is_empty());

    // A clean batch afterwards starts at 1.
    h.pipeline
        .upload_photos(place_id, vec![png_upload("good.png", 16, 16)])
        .await
        .unwrap();
    assert_eq!(photo_nums(&h.db, place_id), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_generates_all_artifacts() {
    let mut h = harness();
    let place_id = place(&h.db, "Workshop");
    let (worker, rx) = h.worker.take().unwrap();
    let worker_handle = tokio::spawn(worker.run(rx));

    h.pipeline
        .upload_photos(place_id, vec![png_upload("shot.png", 1024, 768)])
        .await
        .unwrap();
    let photo = h.db.photos_for_place(place_id).unwrap().remove(0);

    // Wait for the worker to finish the thumbnail and preview jobs.
    let dir = h.storage.place_dir(place_id).unwrap();
    let derived = thumbnails::derived_file_names(&photo.file_name);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let status = h.db.get_photo(photo.id).unwrap().unwrap().thumbnail_status;
        let all_present = derived.iter().all(|name| dir.join(name).is_file());
        if status == ThumbnailStatus::Completed && all_present {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "artifacts not complete in time: status {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Derived sizes respect the no-upscale max-dimension rule.
    let thumb = image::open(dir.join(derived[0].clone())).unwrap();
    assert_eq!(thumb.width().max(thumb.height()), 200);

    drop(h.pipeline);
    worker_handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_cancels_job_for_deleted_photo() {
    let mut h = harness();
    let place_id = place(&h.db, "Ghost");
    h.pipeline
        .upload_photos(place_id, vec![png_upload("gone.png", 32, 32)])
        .await
        .unwrap();
    let photo = h.db.photos_for_place(place_id).unwrap().remove(0);

    // The photo disappears before the worker ever runs its queued job.
    h.pipeline.delete_photo(place_id, photo.photo_num).await.unwrap();

    let (worker, rx) = h.worker.take().unwrap();
    drop(h.pipeline);
    worker.run(rx).await;

    // No derived artifacts appeared for the deleted photo.
    let dir = h.storage.place_dir(place_id).unwrap();
    for name in thumbnails::derived_file_names(&photo.file_name) {
        assert!(!dir.join(name).exists());
    }
}

#[tokio::test]
async fn test_delete_place_removes_directory() {
    let h = harness();
    let place_id = place(&h.db, "Teardown");
    h.pipeline
        .upload_photos(place_id, vec![png_upload("only.png", 16, 16)])
        .await
        .unwrap();
    let dir = h.storage.place_dir(place_id).unwrap();
    assert!(dir.is_dir());

    h.pipeline.delete_place(place_id).unwrap();
    assert!(!dir.exists());
    assert!(!h.db.place_exists(place_id).unwrap());
}
