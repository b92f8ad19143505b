//! Daily rollups over block metrics.
//!
//! Every UTC day touched by the chunk is recomputed from all of that day's
//! metrics, not just the chunk's, so overlapping chunks converge on the same
//! row regardless of processing order. Recomputation is serialized within
//! the process, since the live lane, the history lane and reprocess jobs all
//! share one worker, and the store refuses a row covering fewer blocks than
//! the one it already holds, which covers writers in other replicas.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use ledgermirror_core::derived::{BlockMetrics, DailyStats, DerivedStore};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

pub const ANALYTICS_WORKER: &str = "analytics_worker";

/// `[start, end)` of a UTC day.
pub fn day_bounds(day: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>), IndexerError> {
    let next = day
        .checked_add_days(Days::new(1))
        .ok_or_else(|| IndexerError::permanent(format!("day {day} out of range")))?;
    let start = day.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    let end = next.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(IndexerError::permanent(format!("day {day} out of range"))),
    }
}

/// Roll one day's metrics up. `None` if there are none.
pub fn rollup(day: NaiveDate, metrics: &[BlockMetrics]) -> Option<DailyStats> {
    let first = metrics.iter().map(|m| m.height).min()?;
    let last = metrics.iter().map(|m| m.height).max()?;
    Some(DailyStats {
        day,
        blocks: metrics.len() as u64,
        transactions: metrics.iter().map(|m| m.tx_count).sum(),
        failed_transactions: metrics.iter().map(|m| m.failed_tx_count).sum(),
        events: metrics.iter().map(|m| m.event_count).sum(),
        total_gas: metrics.iter().map(|m| m.total_gas).sum(),
        first_height: first,
        last_height: last,
    })
}

pub struct AnalyticsWorker {
    derived: Arc<dyn DerivedStore>,
    recompute: Mutex<()>,
}

impl AnalyticsWorker {
    pub fn new(derived: Arc<dyn DerivedStore>) -> Self {
        Self {
            derived,
            recompute: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Processor for AnalyticsWorker {
    fn name(&self) -> &str {
        ANALYTICS_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        // read, roll up and write as one step so a slower chunk cannot land
        // an older rollup over a newer one
        let _guard = self.recompute.lock().await;
        let touched: BTreeSet<NaiveDate> = self
            .derived
            .block_metrics_in_range(HeightRange::new(from, to))
            .await?
            .iter()
            .map(|m| m.timestamp.date_naive())
            .collect();

        let mut rows = Vec::with_capacity(touched.len());
        for day in touched {
            let (start, end) = day_bounds(day)?;
            let metrics = self.derived.block_metrics_between(start, end).await?;
            rows.extend(rollup(day, &metrics));
        }
        self.derived.upsert_daily_stats(&rows).await?;
        debug!(worker = ANALYTICS_WORKER, from, to, days = rows.len(), "daily stats recomputed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ledgermirror_storage::InMemoryStorage;

    fn metrics(height: u64, secs: i64) -> BlockMetrics {
        BlockMetrics {
            height,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            tx_count: 2,
            failed_tx_count: 1,
            event_count: 3,
            total_gas: 10,
        }
    }

    #[test]
    fn bounds_cover_one_day() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let (start, end) = day_bounds(day).unwrap();
        assert_eq!((end - start).num_hours(), 24);
        assert_eq!(start.date_naive(), day);
    }

    #[tokio::test]
    async fn recomputes_whole_day_from_partial_chunk() {
        let store = Arc::new(InMemoryStorage::new());
        // 2023-11-14 22:13:20 UTC onwards, one block per hour
        let base = 1_700_000_000;
        let rows: Vec<BlockMetrics> = (0..4).map(|i| metrics(100 + i, base + i as i64 * 3_600)).collect();
        store.upsert_block_metrics(&rows).await.unwrap();

        let worker = AnalyticsWorker::new(store.clone());
        // heights 101 and 102 straddle midnight
        worker.process_range(101, 103).await.unwrap();

        let first = rows[0].timestamp.date_naive();
        let stats = store.daily_stats(first).await.unwrap().unwrap();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.first_height, 100);
        assert_eq!(stats.last_height, 101);
        assert_eq!(stats.transactions, 4);

        let second = rows[2].timestamp.date_naive();
        let stats = store.daily_stats(second).await.unwrap().unwrap();
        assert_eq!(stats.blocks, 2);
        assert_eq!((stats.first_height, stats.last_height), (102, 103));
    }

    #[tokio::test]
    async fn stale_rollup_does_not_replace_a_fuller_one() {
        let store = Arc::new(InMemoryStorage::new());
        let base = 1_700_000_000;
        let day = Utc.timestamp_opt(base, 0).unwrap().date_naive();
        let early = rollup(day, &[metrics(100, base)]).unwrap();
        let full = rollup(day, &[metrics(100, base), metrics(101, base + 60)]).unwrap();

        store.upsert_daily_stats(&[full.clone()]).await.unwrap();
        store.upsert_daily_stats(&[early]).await.unwrap();
        assert_eq!(store.daily_stats(day).await.unwrap(), Some(full));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_chunks_converge_on_the_full_day() {
        let store = Arc::new(InMemoryStorage::new());
        let base = 1_700_000_000;
        // all within the same hour
        let rows: Vec<BlockMetrics> = (0..40).map(|i| metrics(i, base + i as i64)).collect();
        store.upsert_block_metrics(&rows).await.unwrap();

        let worker = Arc::new(AnalyticsWorker::new(store.clone()));
        let mut tasks = tokio::task::JoinSet::new();
        for from in (0..40).step_by(5) {
            let worker = Arc::clone(&worker);
            tasks.spawn(async move { worker.process_range(from, from + 5).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let day = rows[0].timestamp.date_naive();
        let stats = store.daily_stats(day).await.unwrap().unwrap();
        assert_eq!(stats.blocks, 40);
        assert_eq!((stats.first_height, stats.last_height), (0, 39));
    }
}
