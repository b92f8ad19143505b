//! Reprocessing jobs: detached runs that can be polled and cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lease::ttl_to_chrono;
use crate::types::HeightRange;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub worker: String,
    pub range: HeightRange,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub total_chunks: u64,
    pub processed_chunks: u64,
    pub errored_chunks: u64,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Returned to the caller when a job is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub worker: String,
    pub range: HeightRange,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub total_chunks: u64,
}

/// Live state of one job, shared between the runner and pollers.
pub struct JobHandle {
    id: Uuid,
    worker: String,
    range: HeightRange,
    chunk_size: u64,
    concurrency: usize,
    total_chunks: u64,
    processed: AtomicU64,
    errored: AtomicU64,
    status: Mutex<JobStatus>,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl JobHandle {
    pub fn new(worker: &str, range: HeightRange, chunk_size: u64, concurrency: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker: worker.to_string(),
            range,
            chunk_size,
            concurrency,
            total_chunks: range.chunk_count(chunk_size),
            processed: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            status: Mutex::new(JobStatus::Running),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ticket(&self) -> JobTicket {
        JobTicket {
            job_id: self.id,
            worker: self.worker.clone(),
            range: self.range,
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            total_chunks: self.total_chunks,
        }
    }

    /// Count a finished chunk. Returns the processed total so far.
    pub fn record_chunk(&self, ok: bool) -> u64 {
        if !ok {
            self.errored.fetch_add(1, Ordering::Relaxed);
        }
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        let status = if self.cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        *lock(&self.status) = status;
        *lock(&self.finished_at) = Some(Utc::now());
        self.done.cancel();
    }

    /// Wait until the runner calls [`finish`](Self::finish).
    pub async fn wait(&self) {
        self.done.cancelled().await
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            worker: self.worker.clone(),
            range: self.range,
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            total_chunks: self.total_chunks,
            processed_chunks: self.processed.load(Ordering::Relaxed),
            errored_chunks: self.errored.load(Ordering::Relaxed),
            status: *lock(&self.status),
            started_at: self.started_at,
            finished_at: *lock(&self.finished_at),
        }
    }
}

/// How long a finished job stays pollable.
pub const FINISHED_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Jobs started by this process. Finished jobs are dropped once they are
/// older than the retention window.
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Arc<JobHandle>>>,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(FINISHED_JOB_RETENTION)
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn prune(&self, jobs: &mut HashMap<Uuid, Arc<JobHandle>>) {
        let cutoff = Utc::now() - ttl_to_chrono(self.retention);
        jobs.retain(|_, job| match *lock(&job.finished_at) {
            Some(finished) => finished > cutoff,
            None => true,
        });
    }

    pub fn insert(&self, job: Arc<JobHandle>) {
        let mut jobs = lock(&self.jobs);
        self.prune(&mut jobs);
        jobs.insert(job.id(), job);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<JobHandle>> {
        lock(&self.jobs).get(&id).cloned()
    }

    /// Request cancellation. Chunks already running finish first.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.get(id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshots, newest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs = lock(&self.jobs);
        self.prune(&mut jobs);
        let mut out: Vec<JobSnapshot> = jobs.values().map(|j| j.snapshot()).collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_status() {
        let job = JobHandle::new("token_worker", HeightRange::new(0, 2_500), 1_000, 2);
        assert_eq!(job.ticket().total_chunks, 3);
        job.record_chunk(true);
        assert_eq!(job.record_chunk(false), 2);
        let snap = job.snapshot();
        assert_eq!(snap.processed_chunks, 2);
        assert_eq!(snap.errored_chunks, 1);
        assert_eq!(snap.status, JobStatus::Running);

        job.finish();
        let snap = job.snapshot();
        assert_eq!(snap.status, JobStatus::Completed);
        assert!(snap.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_through_registry() {
        let registry = JobRegistry::new();
        let job = Arc::new(JobHandle::new("w", HeightRange::new(0, 10), 5, 1));
        registry.insert(Arc::clone(&job));

        assert!(registry.cancel(job.id()));
        assert!(!registry.cancel(Uuid::new_v4()));
        job.finish();
        job.wait().await;
        assert_eq!(registry.get(job.id()).unwrap().snapshot().status, JobStatus::Cancelled);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn finished_jobs_expire_running_jobs_stay() {
        let registry = JobRegistry::with_retention(Duration::ZERO);
        let done = Arc::new(JobHandle::new("w", HeightRange::new(0, 10), 5, 1));
        let running = Arc::new(JobHandle::new("w", HeightRange::new(0, 10), 5, 1));
        registry.insert(Arc::clone(&done));
        done.finish();

        registry.insert(Arc::clone(&running));
        assert!(registry.get(done.id()).is_none());
        assert!(registry.get(running.id()).is_some());
        assert_eq!(registry.list().len(), 1);
    }
}
