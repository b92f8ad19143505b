//! Derivation worker contract and the loop that drives it.
//!
//! A [`Processor`] turns already-ingested raw heights into rows of its own
//! tables. [`AsyncWorker`] runs one processor: it claims chunks through the
//! [`RangeScheduler`], executes them on a bounded pool, records permanent
//! failures as skipped ranges and folds the checkpoint forward.
//!
//! Forward workers run a second [`Lane::History`] scheduler that walks down
//! from where the forward cursor started, over raw heights the backward
//! ingester fills in later. Both lanes share the worker's concurrency, and
//! the live lane is served first.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::WorkerSettings;
use crate::error::IndexerError;
use crate::lease::LeaseStore;
use crate::ledger::RawLedgerStore;
use crate::policy::RetryPolicy;
use crate::scheduler::{history_cursor, history_watermark, visible_watermark, RangeScheduler};
use crate::tracker::ErrorLedger;
use crate::types::{Direction, HeightRange};

/// A derivation worker.
///
/// `process_range` must be idempotent: running it twice over `[from, to)`
/// leaves the same rows as running it once.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError>;
}

/// What happened to one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChunkOutcome {
    Completed { attempts: u32 },
    Skipped { reason: String },
}

impl ChunkOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `processor` over `range` under a deadline, retrying transient errors.
///
/// Timeouts count as transient. Panics, permanent errors and exhausted
/// retries end in [`ChunkOutcome::Skipped`].
pub async fn execute_chunk(
    processor: &dyn Processor,
    range: HeightRange,
    policy: &RetryPolicy,
    deadline: Duration,
) -> ChunkOutcome {
    let mut attempt = 0u32;
    loop {
        let call = AssertUnwindSafe(processor.process_range(range.start, range.end)).catch_unwind();
        let result = match tokio::time::timeout(deadline, call).await {
            Err(_) => Err(IndexerError::Timeout {
                operation: format!("{} {range}", processor.name()),
                after_ms: deadline.as_millis() as u64,
            }),
            Ok(Err(panic)) => Err(IndexerError::permanent(format!(
                "panic: {}",
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(()) => return ChunkOutcome::Completed { attempts: attempt + 1 },
            Err(e) if e.is_transient() => {
                attempt += 1;
                match policy.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            worker = processor.name(),
                            %range,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return ChunkOutcome::Skipped {
                            reason: format!("gave up after {attempt} attempts: {e}"),
                        }
                    }
                }
            }
            Err(e) => return ChunkOutcome::Skipped { reason: e.to_string() },
        }
    }
}

/// Shared stores and tuning used by every worker loop and by recovery jobs.
#[derive(Clone)]
pub struct WorkerRuntime {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub tracker: Arc<dyn ErrorLedger>,
    pub raw: Arc<dyn RawLedgerStore>,
    /// Checkpoint name of the forward raw ingester.
    pub ingester: String,
    /// Lease holder id for this process.
    pub holder: String,
    pub policy: RetryPolicy,
    pub chunk_timeout: Duration,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
}

/// Which of a worker's schedulers a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Forward from the checkpoint toward the ingested tip.
    Live,
    /// Backward from where the live lane started, over backfilled heights.
    History,
}

/// Outcome of one claim-execute-fold round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub claimed: usize,
    pub completed: usize,
    pub skipped: usize,
    /// New checkpoint if the round moved it.
    pub checkpoint: Option<u64>,
    /// New history cursor if the round moved it.
    pub history: Option<u64>,
}

/// Drives one [`Processor`] through the scheduler.
pub struct AsyncWorker {
    processor: Arc<dyn Processor>,
    settings: WorkerSettings,
    scheduler: RangeScheduler,
    history: Option<RangeScheduler>,
    runtime: WorkerRuntime,
}

impl AsyncWorker {
    pub fn new(
        processor: Arc<dyn Processor>,
        settings: WorkerSettings,
        runtime: WorkerRuntime,
    ) -> Self {
        let scheduler = RangeScheduler::new(
            processor.name(),
            &settings,
            runtime.lease_ttl,
            runtime.holder.clone(),
            Arc::clone(&runtime.checkpoints),
            Arc::clone(&runtime.leases),
        );
        let history = (settings.direction == Direction::Forward && settings.derive_history).then(|| {
            let backward = WorkerSettings {
                direction: Direction::Backward,
                start_height: None,
                ..settings.clone()
            };
            RangeScheduler::new(
                history_cursor(processor.name()),
                &backward,
                runtime.lease_ttl,
                runtime.holder.clone(),
                Arc::clone(&runtime.checkpoints),
                Arc::clone(&runtime.leases),
            )
        });
        Self {
            processor,
            settings,
            scheduler,
            history,
            runtime,
        }
    }

    pub fn name(&self) -> &str {
        self.processor.name()
    }

    pub fn scheduler(&self) -> &RangeScheduler {
        &self.scheduler
    }

    /// The history lane's scheduler, if this worker runs one.
    pub fn history(&self) -> Option<&RangeScheduler> {
        self.history.as_ref()
    }

    fn lane(&self, lane: Lane) -> &RangeScheduler {
        match (lane, &self.history) {
            (Lane::History, Some(history)) => history,
            _ => &self.scheduler,
        }
    }

    async fn claim(&self, max: usize) -> Result<Vec<(Lane, HeightRange)>, IndexerError> {
        let watermark = visible_watermark(
            self.runtime.raw.as_ref(),
            self.runtime.checkpoints.as_ref(),
            &self.runtime.ingester,
            &self.settings.dependencies,
        )
        .await?;
        let mut claimed: Vec<_> = self
            .scheduler
            .claim(watermark, max)
            .await?
            .into_iter()
            .map(|range| (Lane::Live, range))
            .collect();

        let free = max.saturating_sub(claimed.len());
        if free > 0 {
            match self.claim_history(free).await {
                Ok(ranges) => claimed.extend(ranges.into_iter().map(|range| (Lane::History, range))),
                Err(e) => warn!(worker = self.name(), error = %e, "history claim failed"),
            }
        }
        Ok(claimed)
    }

    /// Claim history chunks, nearest first, up to the first one whose raw
    /// blocks are not stored yet. That one and everything past it go back.
    async fn claim_history(&self, max: usize) -> Result<Vec<HeightRange>, IndexerError> {
        let Some(history) = &self.history else {
            return Ok(Vec::new());
        };
        let watermark = history_watermark(
            self.runtime.raw.as_ref(),
            self.runtime.checkpoints.as_ref(),
            self.name(),
            self.settings.start_height,
            &self.settings.dependencies,
        )
        .await?;

        let ranges = history.claim(watermark, max).await?;
        let mut kept = Vec::with_capacity(ranges.len());
        let mut missing = None;
        for (i, range) in ranges.iter().enumerate() {
            match self.runtime.raw.has_blocks(*range).await {
                Ok(true) => kept.push(*range),
                Ok(false) => {
                    debug!(worker = self.name(), %range, "raw history not stored yet");
                    missing = Some(i);
                    break;
                }
                Err(e) => {
                    warn!(worker = self.name(), %range, error = %e, "raw history lookup failed");
                    missing = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = missing {
            for range in &ranges[i..] {
                history.release(*range).await?;
            }
        }
        Ok(kept)
    }

    /// Execute one claimed live chunk and do its bookkeeping.
    pub async fn process_chunk(&self, range: HeightRange) -> ChunkOutcome {
        self.process(Lane::Live, range).await
    }

    /// Execute one claimed chunk of `lane` and do its bookkeeping.
    ///
    /// A skipped chunk is completed only after its error and skipped range
    /// are durably recorded; otherwise the lease is left to expire so the
    /// chunk is retried instead of silently dropped.
    pub async fn process(&self, lane: Lane, range: HeightRange) -> ChunkOutcome {
        let outcome = execute_chunk(
            self.processor.as_ref(),
            range,
            &self.runtime.policy,
            self.runtime.chunk_timeout,
        )
        .await;

        if let ChunkOutcome::Skipped { reason } = &outcome {
            warn!(worker = self.name(), ?lane, %range, %reason, "chunk skipped");
            let recorded = async {
                self.runtime.tracker.record_error(self.name(), range, reason).await?;
                self.runtime
                    .tracker
                    .record_skipped_range(self.name(), range, reason)
                    .await
            }
            .await;
            if let Err(e) = recorded {
                error!(worker = self.name(), %range, error = %e, "failed to record skipped range, leaving lease to expire");
                return outcome;
            }
        }

        if let Err(e) = self.lane(lane).complete(range).await {
            error!(worker = self.name(), ?lane, %range, error = %e, "failed to complete lease, chunk will be reclaimed after TTL");
        }
        outcome
    }

    fn spawn_chunk(
        self: &Arc<Self>,
        set: &mut JoinSet<(HeightRange, ChunkOutcome)>,
        lane: Lane,
        range: HeightRange,
    ) {
        let this = Arc::clone(self);
        set.spawn(async move {
            let outcome = this.process(lane, range).await;
            (range, outcome)
        });
    }

    async fn fold_lane(&self, lane: Lane) -> Option<u64> {
        match self.lane(lane).fold().await {
            Ok(moved) => moved,
            Err(e) => {
                warn!(worker = self.name(), ?lane, error = %e, "checkpoint fold failed");
                None
            }
        }
    }

    /// Fold both lanes. Returns the moves of the live and history cursors.
    async fn fold(&self) -> (Option<u64>, Option<u64>) {
        let live = self.fold_lane(Lane::Live).await;
        let history = match self.history {
            Some(_) => self.fold_lane(Lane::History).await,
            None => None,
        };
        (live, history)
    }

    fn log_join(&self, joined: Result<(HeightRange, ChunkOutcome), JoinError>) {
        if let Err(e) = joined {
            error!(worker = self.name(), error = %e, "chunk task aborted");
        }
    }

    /// Claim up to `concurrency` chunks, run them to completion, then fold.
    pub async fn run_round(self: &Arc<Self>) -> Result<RoundReport, IndexerError> {
        let claimed = self.claim(self.settings.concurrency).await?;
        let mut report = RoundReport {
            claimed: claimed.len(),
            ..RoundReport::default()
        };

        let mut set = JoinSet::new();
        for (lane, range) in claimed {
            self.spawn_chunk(&mut set, lane, range);
        }
        while let Some(joined) = set.join_next().await {
            match &joined {
                Ok((_, ChunkOutcome::Completed { .. })) => report.completed += 1,
                Ok((_, ChunkOutcome::Skipped { .. })) => report.skipped += 1,
                Err(_) => {}
            }
            self.log_join(joined);
        }
        (report.checkpoint, report.history) = self.fold().await;
        Ok(report)
    }

    /// Run until `cancel` fires. In-flight chunks are drained before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), IndexerError> {
        info!(
            worker = self.name(),
            range_size = self.settings.range_size,
            concurrency = self.settings.concurrency,
            direction = %self.settings.direction,
            history = self.history.is_some(),
            "worker started"
        );

        let mut inflight = JoinSet::new();
        while !cancel.is_cancelled() {
            let free = self.settings.concurrency.saturating_sub(inflight.len());
            if free > 0 {
                match self.claim(free).await {
                    Ok(claimed) => {
                        for (lane, range) in claimed {
                            self.spawn_chunk(&mut inflight, lane, range);
                        }
                    }
                    Err(e) => warn!(worker = self.name(), error = %e, "claim failed"),
                }
            }

            if inflight.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.runtime.poll_interval) => {}
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = inflight.join_next() => {
                    self.log_join(joined);
                    self.fold().await;
                }
            }
        }

        while let Some(joined) = inflight.join_next().await {
            self.log_join(joined);
        }
        self.fold().await;
        info!(worker = self.name(), "worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::lease::MemoryLeaseStore;
    use crate::ledger::{CheckpointUpdate, LedgerBlock};
    use crate::policy::RetryConfig;
    use crate::tracker::MemoryErrorLedger;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Raw store that only knows which heights it holds.
    #[derive(Default)]
    struct Heights(Mutex<BTreeSet<u64>>);

    impl Heights {
        fn add(&self, range: std::ops::Range<u64>) {
            self.0.lock().unwrap().extend(range);
        }
    }

    #[async_trait]
    impl RawLedgerStore for Heights {
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
            Ok(self.0.lock().unwrap().first().copied())
        }
        async fn has_blocks(&self, range: HeightRange) -> Result<bool, IndexerError> {
            Ok(self.0.lock().unwrap().range(range.start..range.end).next().is_some())
        }
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<HeightRange>>);

    #[async_trait]
    impl Processor for Seen {
        fn name(&self) -> &str {
            "w"
        }
        async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
            self.0.lock().unwrap().push(HeightRange::new(from, to));
            Ok(())
        }
    }

    fn runtime(raw: Arc<Heights>, checkpoints: Arc<MemoryCheckpointStore>) -> WorkerRuntime {
        WorkerRuntime {
            checkpoints,
            leases: Arc::new(MemoryLeaseStore::new()),
            tracker: Arc::new(MemoryErrorLedger::new()),
            raw,
            ingester: "main_ingester".into(),
            holder: "test".into(),
            policy: RetryPolicy::no_retry(),
            chunk_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn history_worker(raw: &Arc<Heights>, cps: &Arc<MemoryCheckpointStore>, seen: &Arc<Seen>) -> Arc<AsyncWorker> {
        let settings = WorkerSettings {
            range_size: 10,
            concurrency: 2,
            ..WorkerSettings::default()
        };
        Arc::new(AsyncWorker::new(seen.clone(), settings, runtime(raw.clone(), cps.clone())))
    }

    struct Flaky {
        failures_left: AtomicU32,
        transient: bool,
    }

    #[async_trait]
    impl Processor for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn process_range(&self, _from: u64, _to: u64) -> Result<(), IndexerError> {
            if self.failures_left.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            if self.transient {
                Err(IndexerError::Rpc("connection reset".into()))
            } else {
                Err(IndexerError::permanent("unsupported construct"))
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl Processor for Panics {
        fn name(&self) -> &str {
            "panics"
        }
        async fn process_range(&self, from: u64, _to: u64) -> Result<(), IndexerError> {
            if from < u64::MAX {
                panic!("index out of bounds");
            }
            Ok(())
        }
    }

    struct Slow;

    #[async_trait]
    impl Processor for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn process_range(&self, _from: u64, _to: u64) -> Result<(), IndexerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        })
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let p = Flaky { failures_left: AtomicU32::new(2), transient: true };
        let outcome =
            execute_chunk(&p, HeightRange::new(0, 10), &fast_policy(3), Duration::from_secs(1)).await;
        assert_eq!(outcome, ChunkOutcome::Completed { attempts: 3 });
    }

    #[tokio::test]
    async fn exhausted_retries_become_skip() {
        let p = Flaky { failures_left: AtomicU32::new(10), transient: true };
        let outcome =
            execute_chunk(&p, HeightRange::new(0, 10), &fast_policy(2), Duration::from_secs(1)).await;
        match outcome {
            ChunkOutcome::Skipped { reason } => assert!(reason.contains("gave up after 3 attempts")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_skip_immediately() {
        let p = Flaky { failures_left: AtomicU32::new(1), transient: false };
        let outcome =
            execute_chunk(&p, HeightRange::new(0, 10), &fast_policy(5), Duration::from_secs(1)).await;
        assert!(!outcome.is_completed());
        assert_eq!(p.failures_left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let outcome =
            execute_chunk(&Panics, HeightRange::new(0, 10), &fast_policy(0), Duration::from_secs(1))
                .await;
        match outcome {
            ChunkOutcome::Skipped { reason } => assert!(reason.contains("index out of bounds")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeouts_are_transient() {
        let outcome =
            execute_chunk(&Slow, HeightRange::new(0, 10), &fast_policy(1), Duration::from_millis(10))
                .await;
        match outcome {
            ChunkOutcome::Skipped { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn backfilled_heights_are_derived_by_history_lane() {
        let raw = Arc::new(Heights::default());
        let cps = Arc::new(MemoryCheckpointStore::new());
        let seen = Arc::new(Seen::default());
        raw.add(20..40);
        cps.set_checkpoint("main_ingester", 40).await.unwrap();

        let worker = history_worker(&raw, &cps, &seen);
        let report = worker.run_round().await.unwrap();
        assert_eq!((report.claimed, report.checkpoint, report.history), (2, Some(40), None));
        assert_eq!(cps.get_height("w_history").await.unwrap(), 20);

        // the backward ingester fills in below where the worker started
        raw.add(0..20);
        let report = worker.run_round().await.unwrap();
        assert_eq!((report.claimed, report.checkpoint, report.history), (2, None, Some(0)));

        let mut ranges = seen.0.lock().unwrap().clone();
        ranges.sort_by_key(|r| r.start);
        assert_eq!(ranges, (0..4).map(|i| HeightRange::new(i * 10, i * 10 + 10)).collect::<Vec<_>>());
        assert_eq!(worker.run_round().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn history_waits_for_missing_raw_blocks() {
        let raw = Arc::new(Heights::default());
        let cps = Arc::new(MemoryCheckpointStore::new());
        let seen = Arc::new(Seen::default());
        raw.add(20..40);
        cps.set_checkpoint("main_ingester", 40).await.unwrap();
        let worker = history_worker(&raw, &cps, &seen);
        worker.run_round().await.unwrap();

        // 0..5 arrives but 5..20 does not: nothing below 20 may be marked done
        raw.add(0..5);
        let report = worker.run_round().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(cps.get_height("w_history").await.unwrap(), 20);
        assert!(worker.history().is_some());

        raw.add(5..20);
        let report = worker.run_round().await.unwrap();
        assert_eq!((report.claimed, report.history), (2, Some(0)));
    }

    #[tokio::test]
    async fn history_lane_only_for_forward_workers_that_want_it() {
        let raw = Arc::new(Heights::default());
        let cps = Arc::new(MemoryCheckpointStore::new());
        let seen: Arc<dyn Processor> = Arc::new(Seen::default());
        let off = WorkerSettings {
            derive_history: false,
            ..WorkerSettings::default()
        };
        let backward = WorkerSettings {
            direction: Direction::Backward,
            ..WorkerSettings::default()
        };
        for settings in [off, backward] {
            let worker = AsyncWorker::new(seen.clone(), settings, runtime(raw.clone(), cps.clone()));
            assert!(worker.history().is_none());
        }
    }
}
