//! Operator recovery: checkpoint rewind, backward redirect and reprocessing.
//!
//! Nothing here runs on its own. Every operation validates its input before
//! touching state and returns a before/after report.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::IndexerError;
use crate::job::{JobHandle, JobRegistry, JobSnapshot, JobTicket};
use crate::scheduler::history_cursor;
use crate::tracker::{ErrorReport, ResolveReport, SkippedRange};
use crate::types::{Chunks, Direction, HeightRange};
use crate::worker::{execute_chunk, ChunkOutcome, Processor, WorkerRuntime};

/// Progress is logged every this many chunks.
const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    pub worker: String,
    pub direction: Direction,
    pub previous_height: Option<u64>,
    pub new_height: u64,
    pub leases_deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectReport {
    pub ingester: String,
    pub previous_height: Option<u64>,
    pub new_height: u64,
}

struct Registered {
    processor: Arc<dyn Processor>,
    direction: Direction,
}

/// Administrative control surface over checkpoints, leases and the error ledger.
pub struct RecoveryController {
    runtime: WorkerRuntime,
    workers: HashMap<String, Registered>,
    backward_ingester: String,
    max_concurrency: usize,
    jobs: Arc<JobRegistry>,
}

impl RecoveryController {
    pub fn new(
        runtime: WorkerRuntime,
        backward_ingester: impl Into<String>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            runtime,
            workers: HashMap::new(),
            backward_ingester: backward_ingester.into(),
            max_concurrency: max_concurrency.max(1),
            jobs: Arc::new(JobRegistry::new()),
        }
    }

    /// Make a worker addressable by name.
    pub fn register(&mut self, processor: Arc<dyn Processor>, direction: Direction) {
        self.workers
            .insert(processor.name().to_string(), Registered { processor, direction });
    }

    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, worker: &str) -> Result<&Registered, IndexerError> {
        self.workers
            .get(worker)
            .ok_or_else(|| IndexerError::UnknownWorker(worker.to_string()))
    }

    /// Rewind `worker` to `height` and drop its leases at or after it.
    ///
    /// Delete the bad derived rows first, then call this; the live scheduler
    /// re-claims the region on its next round.
    pub async fn reset_worker_to_height(
        &self,
        worker: &str,
        height: u64,
    ) -> Result<ResetReport, IndexerError> {
        let direction = self.lookup(worker)?.direction;
        if height == 0 {
            return Err(IndexerError::config("height must be greater than 0"));
        }

        let previous = self.runtime.checkpoints.load(worker).await?.map(|cp| cp.height);
        self.runtime.checkpoints.set_checkpoint(worker, height).await?;
        let mut leases_deleted = self.runtime.leases.delete_from(worker, height, direction).await?;

        // history must stay below the forward cursor
        if direction == Direction::Forward {
            let history = history_cursor(worker);
            if let Some(cp) = self.runtime.checkpoints.load(&history).await? {
                if cp.height > height {
                    self.runtime.checkpoints.set_checkpoint(&history, height).await?;
                    leases_deleted += self
                        .runtime
                        .leases
                        .delete_from(&history, 0, Direction::Forward)
                        .await?;
                }
            }
        }

        let report = ResetReport {
            worker: worker.to_string(),
            direction,
            previous_height: previous,
            new_height: height,
            leases_deleted,
        };
        info!(
            worker,
            previous = ?report.previous_height,
            new = height,
            leases_deleted,
            "reset worker checkpoint"
        );
        Ok(report)
    }

    /// Point the backward ingester at an arbitrary height.
    pub async fn redirect_backward_ingester(
        &self,
        height: u64,
    ) -> Result<RedirectReport, IndexerError> {
        if height == 0 {
            return Err(IndexerError::config("height must be greater than 0"));
        }
        let ingester = self.backward_ingester.as_str();
        let previous = self.runtime.checkpoints.load(ingester).await?.map(|cp| cp.height);
        self.runtime.checkpoints.set_checkpoint(ingester, height).await?;
        info!(ingester, previous = ?previous, new = height, "redirected backward ingester");
        Ok(RedirectReport {
            ingester: ingester.to_string(),
            previous_height: previous,
            new_height: height,
        })
    }

    /// Re-run `worker` over `[from, to)` as a detached job.
    ///
    /// Runs outside the lease table. Per-chunk failures are recorded and
    /// counted; the job keeps going.
    pub fn reprocess_worker(
        &self,
        worker: &str,
        from: u64,
        to: u64,
        chunk_size: u64,
        concurrency: usize,
    ) -> Result<JobTicket, IndexerError> {
        let processor = Arc::clone(&self.lookup(worker)?.processor);
        if to <= from {
            return Err(IndexerError::config(format!(
                "to_height ({to}) must be greater than from_height ({from})"
            )));
        }
        if chunk_size == 0 {
            return Err(IndexerError::config("chunk_size must be greater than 0"));
        }
        if concurrency == 0 || concurrency > self.max_concurrency {
            return Err(IndexerError::config(format!(
                "concurrency must be between 1 and {}",
                self.max_concurrency
            )));
        }

        let range = HeightRange::new(from, to);
        let job = Arc::new(JobHandle::new(worker, range, chunk_size, concurrency));
        self.jobs.insert(Arc::clone(&job));
        let ticket = job.ticket();
        info!(
            worker,
            job_id = %ticket.job_id,
            %range,
            chunk_size,
            concurrency,
            total_chunks = ticket.total_chunks,
            "reprocess job started"
        );

        tokio::spawn(run_reprocess(processor, self.runtime.clone(), job, range.chunks(chunk_size)));
        Ok(ticket)
    }

    pub fn job_status(&self, id: Uuid) -> Option<JobSnapshot> {
        self.jobs.get(id).map(|j| j.snapshot())
    }

    pub fn job(&self, id: Uuid) -> Option<Arc<JobHandle>> {
        self.jobs.get(id)
    }

    pub fn cancel_job(&self, id: Uuid) -> bool {
        self.jobs.cancel(id)
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.jobs.list()
    }

    pub async fn list_errors(
        &self,
        worker: Option<&str>,
        limit: usize,
    ) -> Result<ErrorReport, IndexerError> {
        self.runtime.tracker.list_errors(worker, limit).await
    }

    pub async fn list_skipped_ranges(
        &self,
        worker: Option<&str>,
    ) -> Result<Vec<SkippedRange>, IndexerError> {
        self.runtime.tracker.list_skipped_ranges(worker).await
    }

    pub async fn resolve_errors(&self, worker: &str) -> Result<ResolveReport, IndexerError> {
        let report = self.runtime.tracker.resolve_errors(worker).await?;
        info!(
            worker,
            errors = report.errors_resolved,
            skipped_ranges = report.skipped_ranges_resolved,
            "resolved errors"
        );
        Ok(report)
    }
}

async fn run_reprocess(
    processor: Arc<dyn Processor>,
    runtime: WorkerRuntime,
    job: Arc<JobHandle>,
    chunks: Chunks,
) {
    let cancel = job.cancel_token();
    let concurrency = job.ticket().concurrency;
    let worker = processor.name().to_string();

    // stop pulling new chunks once cancelled; running ones finish
    let gate = cancel.clone();
    let mut results = futures::stream::iter(chunks)
        .take_while(move |_| futures::future::ready(!gate.is_cancelled()))
        .map(|range| {
            let processor = Arc::clone(&processor);
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let outcome = execute_chunk(
                    processor.as_ref(),
                    range,
                    &runtime.policy,
                    runtime.chunk_timeout,
                )
                .await;
                settle_chunk(&runtime, processor.name(), range, &outcome).await;
                Some(outcome.is_completed())
            }
        })
        .buffer_unordered(concurrency);

    while let Some(result) = results.next().await {
        let Some(ok) = result else { continue };
        let processed = job.record_chunk(ok);
        if processed % PROGRESS_EVERY == 0 {
            info!(
                worker = %worker,
                job_id = %job.id(),
                processed,
                errored = job.errored(),
                "reprocess progress"
            );
        }
    }

    job.finish();
    let snap = job.snapshot();
    info!(
        worker = %worker,
        job_id = %snap.id,
        status = ?snap.status,
        processed = snap.processed_chunks,
        errored = snap.errored_chunks,
        total = snap.total_chunks,
        "reprocess job finished"
    );
}

/// Record a failed reprocess chunk, or clear the gaps a successful one repaired.
async fn settle_chunk(
    runtime: &WorkerRuntime,
    worker: &str,
    range: HeightRange,
    outcome: &ChunkOutcome,
) {
    match outcome {
        ChunkOutcome::Completed { .. } => {
            if let Err(e) = runtime.tracker.resolve_skipped_within(worker, range).await {
                warn!(worker, %range, error = %e, "could not resolve skipped ranges");
            }
        }
        ChunkOutcome::Skipped { reason } => {
            warn!(worker, %range, %reason, "reprocess chunk failed");
            let message = format!("reprocess: {reason}");
            let recorded = async {
                runtime.tracker.record_error(worker, range, &message).await?;
                runtime.tracker.record_skipped_range(worker, range, &message).await
            }
            .await;
            if let Err(e) = recorded {
                error!(worker, %range, error = %e, "failed to record reprocess failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::job::JobStatus;
    use crate::lease::{LeaseStore, MemoryLeaseStore};
    use crate::ledger::{CheckpointUpdate, LedgerBlock, RawLedgerStore};
    use crate::policy::RetryPolicy;
    use crate::tracker::{ErrorLedger, MemoryErrorLedger};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoRaw;

    #[async_trait]
    impl RawLedgerStore for NoRaw {
        async fn save_batch(&self, _: &[LedgerBlock], _: CheckpointUpdate) -> Result<bool, IndexerError> {
            Ok(false)
        }
        async fn blocks_in_range(&self, _: HeightRange) -> Result<Vec<LedgerBlock>, IndexerError> {
            Ok(Vec::new())
        }
        async fn block(&self, _: u64) -> Result<Option<LedgerBlock>, IndexerError> {
            Ok(None)
        }
        async fn lowest_height(&self) -> Result<Option<u64>, IndexerError> {
            Ok(None)
        }
        async fn has_blocks(&self, _: HeightRange) -> Result<bool, IndexerError> {
            Ok(false)
        }
    }

    /// Records ranges; fails any range starting at `fail_at`.
    struct Recorder {
        seen: Mutex<Vec<HeightRange>>,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl Processor for Recorder {
        fn name(&self) -> &str {
            "token_worker"
        }
        async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
            self.seen.lock().unwrap().push(HeightRange::new(from, to));
            if self.fail_at == Some(from) {
                return Err(IndexerError::permanent("bad payload"));
            }
            Ok(())
        }
    }

    struct Fixture {
        controller: RecoveryController,
        checkpoints: Arc<MemoryCheckpointStore>,
        leases: Arc<MemoryLeaseStore>,
        tracker: Arc<MemoryErrorLedger>,
        processor: Arc<Recorder>,
    }

    fn fixture(fail_at: Option<u64>) -> Fixture {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let leases = Arc::new(MemoryLeaseStore::new());
        let tracker = Arc::new(MemoryErrorLedger::new());
        let runtime = WorkerRuntime {
            checkpoints: checkpoints.clone(),
            leases: leases.clone(),
            tracker: tracker.clone(),
            raw: Arc::new(NoRaw),
            ingester: "main_ingester".into(),
            holder: "test".into(),
            policy: RetryPolicy::no_retry(),
            chunk_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        };
        let processor = Arc::new(Recorder { seen: Mutex::new(Vec::new()), fail_at });
        let mut controller = RecoveryController::new(runtime, "history_ingester", 16);
        controller.register(processor.clone(), Direction::Forward);
        Fixture { controller, checkpoints, leases, tracker, processor }
    }

    #[tokio::test]
    async fn reset_rewinds_and_drops_leases() {
        let f = fixture(None);
        f.checkpoints.set_checkpoint("token_worker", 9_000).await.unwrap();
        for start in [8_000u64, 9_000, 10_000] {
            f.leases
                .try_acquire("token_worker", HeightRange::new(start, start + 1_000), "x", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let report = f.controller.reset_worker_to_height("token_worker", 9_000).await.unwrap();
        assert_eq!(report.previous_height, Some(9_000));
        assert_eq!(report.leases_deleted, 2);

        let report = f.controller.reset_worker_to_height("token_worker", 5_000).await.unwrap();
        assert_eq!(report.new_height, 5_000);
        assert_eq!(report.leases_deleted, 1);
        assert_eq!(f.checkpoints.get_height("token_worker").await.unwrap(), 5_000);
    }

    #[tokio::test]
    async fn reset_below_history_pulls_history_down() {
        let f = fixture(None);
        f.checkpoints.set_checkpoint("token_worker", 9_000).await.unwrap();
        f.checkpoints.set_checkpoint("token_worker_history", 6_000).await.unwrap();
        f.leases
            .try_acquire("token_worker_history", HeightRange::new(5_000, 6_000), "x", Duration::from_secs(60))
            .await
            .unwrap();

        // above history: history untouched
        let report = f.controller.reset_worker_to_height("token_worker", 7_000).await.unwrap();
        assert_eq!(report.leases_deleted, 0);
        assert_eq!(f.checkpoints.get_height("token_worker_history").await.unwrap(), 6_000);

        let report = f.controller.reset_worker_to_height("token_worker", 4_000).await.unwrap();
        assert_eq!(report.leases_deleted, 1);
        assert_eq!(f.checkpoints.get_height("token_worker_history").await.unwrap(), 4_000);
        assert!(f.leases.active("token_worker_history").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_have_no_side_effects() {
        let f = fixture(None);
        f.checkpoints.set_checkpoint("token_worker", 9_000).await.unwrap();

        assert!(matches!(
            f.controller.reset_worker_to_height("nope", 10).await,
            Err(IndexerError::UnknownWorker(_))
        ));
        assert!(f.controller.reset_worker_to_height("token_worker", 0).await.is_err());
        assert!(f.controller.redirect_backward_ingester(0).await.is_err());
        assert!(f.controller.reprocess_worker("token_worker", 100, 100, 10, 1).is_err());
        assert!(f.controller.reprocess_worker("token_worker", 200, 100, 10, 1).is_err());
        assert!(f.controller.reprocess_worker("token_worker", 0, 100, 0, 1).is_err());
        assert!(f.controller.reprocess_worker("token_worker", 0, 100, 10, 0).is_err());
        assert!(f.controller.reprocess_worker("token_worker", 0, 100, 10, 17).is_err());

        assert_eq!(f.checkpoints.get_height("token_worker").await.unwrap(), 9_000);
        assert!(f.controller.list_jobs().is_empty());
        assert!(f.processor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn redirect_reports_previous_height() {
        let f = fixture(None);
        let first = f.controller.redirect_backward_ingester(50_000).await.unwrap();
        assert_eq!(first.previous_height, None);
        let second = f.controller.redirect_backward_ingester(42_000).await.unwrap();
        assert_eq!(second.previous_height, Some(50_000));
        assert_eq!(f.checkpoints.get_height("history_ingester").await.unwrap(), 42_000);
    }

    #[tokio::test]
    async fn reprocess_runs_every_chunk_and_surfaces_failures() {
        let f = fixture(Some(1_000));
        f.tracker
            .record_skipped_range("token_worker", HeightRange::new(2_000, 2_500), "old failure")
            .await
            .unwrap();

        let ticket = f.controller.reprocess_worker("token_worker", 0, 3_000, 1_000, 2).unwrap();
        assert_eq!(ticket.total_chunks, 3);
        f.controller.job(ticket.job_id).unwrap().wait().await;

        let snap = f.controller.job_status(ticket.job_id).unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.processed_chunks, 3);
        assert_eq!(snap.errored_chunks, 1);

        let mut seen = f.processor.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, HeightRange::new(0, 3_000).chunks(1_000).collect::<Vec<_>>());

        // old gap repaired, new failure recorded
        let skipped = f.controller.list_skipped_ranges(Some("token_worker")).await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].range, HeightRange::new(1_000, 2_000));
        let errors = f.controller.list_errors(Some("token_worker"), 10).await.unwrap();
        assert_eq!(errors.errors.len(), 1);
        assert!(errors.errors[0].message.starts_with("reprocess:"));

        // reprocessing never moves the live checkpoint
        assert!(f.checkpoints.load("token_worker").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn huge_reprocess_starts_at_once_and_cancels() {
        let f = fixture(None);
        let ticket = f.controller.reprocess_worker("token_worker", 0, u64::MAX, 1, 1).unwrap();
        assert_eq!(ticket.total_chunks, u64::MAX);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.controller.cancel_job(ticket.job_id));
        f.controller.job(ticket.job_id).unwrap().wait().await;

        let snap = f.controller.job_status(ticket.job_id).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert!(snap.processed_chunks < snap.total_chunks);
    }

    #[tokio::test]
    async fn resolve_errors_reports_counts() {
        let f = fixture(None);
        f.tracker.record_error("token_worker", HeightRange::new(0, 1), "x").await.unwrap();
        let report = f.controller.resolve_errors("token_worker").await.unwrap();
        assert_eq!(report.errors_resolved, 1);
        assert_eq!(report.skipped_ranges_resolved, 0);
    }
}
