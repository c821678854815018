//! Background job plumbing: a bounded queue with duplicate suppression and
//! the worker that drains it.

mod worker;

pub use worker::JobWorker;

use crate::JobConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// One unit of background work. A fixed struct per job type; dispatch is an
/// exhaustive match in the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Thumbnail {
        photo_id: i64,
        place_id: i64,
        file_name: String,
    },
    Preview {
        photo_id: i64,
        place_id: i64,
        file_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum JobKind {
    Thumbnail,
    Preview,
}

impl Job {
    pub fn photo_id(&self) -> i64 {
        match self {
            Job::Thumbnail { photo_id, .. } | Job::Preview { photo_id, .. } => *photo_id,
        }
    }

    fn kind(&self) -> JobKind {
        match self {
            Job::Thumbnail { .. } => JobKind::Thumbnail,
            Job::Preview { .. } => JobKind::Preview,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job queue is full")]
    QueueFull,

    #[error("job queue is closed")]
    QueueClosed,
}

/// At-least-once, in-process delivery. Enqueues for the same photo and job
/// type within the dedup window are suppressed so a retry sweep cannot flood
/// the queue with work that is already scheduled.
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    window: Duration,
    recent: Mutex<HashMap<(i64, JobKind), Instant>>,
}

impl JobQueue {
    pub fn new(config: &JobConfig) -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue = Arc::new(Self {
            tx,
            window: Duration::from_secs(config.dedup_window_secs),
            recent: Mutex::new(HashMap::new()),
        });
        (queue, rx)
    }

    /// Returns `Ok(true)` when the job was queued, `Ok(false)` when it was
    /// suppressed as a recent duplicate.
    pub fn enqueue(&self, job: Job) -> Result<bool, JobError> {
        let key = (job.photo_id(), job.kind());
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            recent.retain(|_, seen| now.duration_since(*seen) < self.window);
            if recent.contains_key(&key) {
                debug!("suppressing duplicate {:?} for photo {}", key.1, key.0);
                return Ok(false);
            }
            recent.insert(key, now);
        }

        match self.tx.try_send(job) {
            Ok(()) => Ok(true),
            Err(e) => {
                // Failed enqueues must not poison the dedup window.
                let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
                recent.remove(&key);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(JobError::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(JobError::QueueClosed),
                }
            }
        }
    }
}
