//! Error & gap tracker.
//!
//! Every failure that the pipeline chooses to route around ends up here. A
//! skipped range exists exactly when a chunk failed permanently and the
//! checkpoint moved past it anyway; it stays unresolved until an operator
//! reprocesses the range.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::IndexerError;
use crate::types::HeightRange;

/// Histogram entries returned by [`ErrorLedger::list_errors`].
pub const MESSAGE_HISTOGRAM_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingError {
    pub id: u64,
    pub worker: String,
    pub range: HeightRange,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRange {
    pub id: u64,
    pub worker: String,
    pub range: HeightRange,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCount {
    pub message: String,
    pub count: u64,
}

/// Recent unresolved errors plus message frequencies for triage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorReport {
    pub errors: Vec<IndexingError>,
    pub message_counts: Vec<MessageCount>,
    pub total_unresolved: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReport {
    pub worker: String,
    pub errors_resolved: u64,
    pub skipped_ranges_resolved: u64,
}

#[async_trait]
pub trait ErrorLedger: Send + Sync {
    async fn record_error(
        &self,
        worker: &str,
        range: HeightRange,
        message: &str,
    ) -> Result<(), IndexerError>;

    /// Newest unresolved errors first, at most `limit`, optionally scoped to one worker.
    async fn list_errors(
        &self,
        worker: Option<&str>,
        limit: usize,
    ) -> Result<ErrorReport, IndexerError>;

    async fn record_skipped_range(
        &self,
        worker: &str,
        range: HeightRange,
        reason: &str,
    ) -> Result<(), IndexerError>;

    /// Unresolved skipped ranges ordered by start height.
    async fn list_skipped_ranges(
        &self,
        worker: Option<&str>,
    ) -> Result<Vec<SkippedRange>, IndexerError>;

    /// Bulk-resolve every open error and skipped range of `worker`.
    async fn resolve_errors(&self, worker: &str) -> Result<ResolveReport, IndexerError>;

    /// Resolve skipped ranges that lie inside `range`. Returns how many.
    async fn resolve_skipped_within(
        &self,
        worker: &str,
        range: HeightRange,
    ) -> Result<u64, IndexerError>;
}

/// Count identical messages, most frequent first, ties by message text.
pub fn message_histogram<'a>(messages: impl IntoIterator<Item = &'a str>) -> Vec<MessageCount> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for m in messages {
        *counts.entry(m).or_default() += 1;
    }
    let mut out: Vec<MessageCount> = counts
        .into_iter()
        .map(|(message, count)| MessageCount {
            message: message.to_string(),
            count,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    out.truncate(MESSAGE_HISTOGRAM_LIMIT);
    out
}

// ─── In-memory ledger ────────────────────────────────────────────────────────

#[derive(Default)]
struct LedgerTables {
    next_id: u64,
    errors: Vec<IndexingError>,
    skipped: Vec<SkippedRange>,
}

impl LedgerTables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryErrorLedger {
    tables: Mutex<LedgerTables>,
}

impl MemoryErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn in_scope(row_worker: &str, worker: Option<&str>) -> bool {
    worker.map(|w| w == row_worker).unwrap_or(true)
}

#[async_trait]
impl ErrorLedger for MemoryErrorLedger {
    async fn record_error(
        &self,
        worker: &str,
        range: HeightRange,
        message: &str,
    ) -> Result<(), IndexerError> {
        let mut t = self.tables.lock().await;
        let id = t.next_id();
        t.errors.push(IndexingError {
            id,
            worker: worker.to_string(),
            range,
            message: message.to_string(),
            occurred_at: Utc::now(),
            resolved: false,
        });
        Ok(())
    }

    async fn list_errors(
        &self,
        worker: Option<&str>,
        limit: usize,
    ) -> Result<ErrorReport, IndexerError> {
        let t = self.tables.lock().await;
        let open: Vec<&IndexingError> = t
            .errors
            .iter()
            .filter(|e| !e.resolved && in_scope(&e.worker, worker))
            .collect();

        let message_counts = message_histogram(open.iter().map(|e| e.message.as_str()));
        let errors = open.iter().rev().take(limit).map(|e| (*e).clone()).collect();
        Ok(ErrorReport {
            errors,
            message_counts,
            total_unresolved: open.len() as u64,
        })
    }

    async fn record_skipped_range(
        &self,
        worker: &str,
        range: HeightRange,
        reason: &str,
    ) -> Result<(), IndexerError> {
        let mut t = self.tables.lock().await;
        let id = t.next_id();
        t.skipped.push(SkippedRange {
            id,
            worker: worker.to_string(),
            range,
            reason: reason.to_string(),
            occurred_at: Utc::now(),
            resolved: false,
        });
        Ok(())
    }

    async fn list_skipped_ranges(
        &self,
        worker: Option<&str>,
    ) -> Result<Vec<SkippedRange>, IndexerError> {
        let t = self.tables.lock().await;
        let mut out: Vec<SkippedRange> = t
            .skipped
            .iter()
            .filter(|s| !s.resolved && in_scope(&s.worker, worker))
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.range.start, s.id));
        Ok(out)
    }

    async fn resolve_errors(&self, worker: &str) -> Result<ResolveReport, IndexerError> {
        let mut t = self.tables.lock().await;
        let mut errors_resolved = 0;
        for e in t.errors.iter_mut().filter(|e| e.worker == worker && !e.resolved) {
            e.resolved = true;
            errors_resolved += 1;
        }
        let mut skipped_ranges_resolved = 0;
        for s in t.skipped.iter_mut().filter(|s| s.worker == worker && !s.resolved) {
            s.resolved = true;
            skipped_ranges_resolved += 1;
        }
        Ok(ResolveReport {
            worker: worker.to_string(),
            errors_resolved,
            skipped_ranges_resolved,
        })
    }

    async fn resolve_skipped_within(
        &self,
        worker: &str,
        range: HeightRange,
    ) -> Result<u64, IndexerError> {
        let mut t = self.tables.lock().await;
        let mut n = 0;
        for s in t
            .skipped
            .iter_mut()
            .filter(|s| s.worker == worker && !s.resolved && range.covers(&s.range))
        {
            s.resolved = true;
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn errors_listed_newest_first_with_histogram() {
        let ledger = MemoryErrorLedger::new();
        ledger.record_error("token_worker", HeightRange::new(0, 10), "bad payload").await.unwrap();
        ledger.record_error("token_worker", HeightRange::new(10, 20), "timeout").await.unwrap();
        ledger.record_error("token_worker", HeightRange::new(20, 30), "bad payload").await.unwrap();
        ledger.record_error("evm_worker", HeightRange::new(0, 10), "bad payload").await.unwrap();

        let report = ledger.list_errors(Some("token_worker"), 2).await.unwrap();
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].range, HeightRange::new(20, 30));
        assert_eq!(report.total_unresolved, 3);
        assert_eq!(
            report.message_counts[0],
            MessageCount { message: "bad payload".into(), count: 2 }
        );

        let all = ledger.list_errors(None, 100).await.unwrap();
        assert_eq!(all.total_unresolved, 4);
        assert_eq!(all.message_counts[0].count, 3);
    }

    #[tokio::test]
    async fn resolve_errors_clears_errors_and_gaps() {
        let ledger = MemoryErrorLedger::new();
        ledger.record_error("w", HeightRange::new(0, 10), "boom").await.unwrap();
        ledger.record_skipped_range("w", HeightRange::new(0, 10), "boom").await.unwrap();
        ledger.record_skipped_range("other", HeightRange::new(0, 10), "boom").await.unwrap();

        let report = ledger.resolve_errors("w").await.unwrap();
        assert_eq!(report.errors_resolved, 1);
        assert_eq!(report.skipped_ranges_resolved, 1);
        assert!(ledger.list_errors(Some("w"), 10).await.unwrap().errors.is_empty());
        assert!(ledger.list_skipped_ranges(Some("w")).await.unwrap().is_empty());
        assert_eq!(ledger.list_skipped_ranges(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolve_within_only_touches_covered_ranges() {
        let ledger = MemoryErrorLedger::new();
        ledger.record_skipped_range("w", HeightRange::new(1_000, 2_000), "x").await.unwrap();
        ledger.record_skipped_range("w", HeightRange::new(2_000, 3_000), "x").await.unwrap();
        let n = ledger.resolve_skipped_within("w", HeightRange::new(0, 2_000)).await.unwrap();
        assert_eq!(n, 1);
        let open = ledger.list_skipped_ranges(Some("w")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].range, HeightRange::new(2_000, 3_000));
    }

    #[test]
    fn histogram_is_bounded() {
        let msgs: Vec<String> = (0..50).map(|i| format!("m{i}")).collect();
        let hist = message_histogram(msgs.iter().map(|s| s.as_str()));
        assert_eq!(hist.len(), MESSAGE_HISTOGRAM_LIMIT);
    }
}
