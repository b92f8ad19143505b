//! Range leases: exclusive, expiring claims on a chunk of heights.
//!
//! A lease row is keyed by `(worker, range_start)`. Inserting it is the only
//! mutual exclusion between replicas of the same worker. Completed leases stay
//! behind as the durable pending set until the scheduler folds the checkpoint
//! over them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::IndexerError;
use crate::types::{Direction, HeightRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Completed,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A claim on one chunk of a worker's height space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker: String,
    pub range: HeightRange,
    pub holder: String,
    pub status: LeaseStatus,
    /// Number of times this chunk was claimed, including TTL reclaims.
    pub attempts: u32,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == LeaseStatus::Active && self.expires_at <= now
    }
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Returns `true` if a lease lies "at or after" `height` in `direction`.
pub fn lease_at_or_after(range: &HeightRange, height: u64, direction: Direction) -> bool {
    match direction {
        Direction::Forward => range.start >= height,
        Direction::Backward => range.end <= height,
    }
}

/// Returns `true` if a lease is fully behind the checkpoint.
pub fn lease_behind(range: &HeightRange, checkpoint: u64, direction: Direction) -> bool {
    match direction {
        Direction::Forward => range.end <= checkpoint,
        Direction::Backward => range.start >= checkpoint,
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim `range` for `holder`.
    ///
    /// Succeeds if no lease exists for `(worker, range.start)` or if the
    /// existing one is active but past its `expires_at`. Returns `None` when
    /// another holder owns the chunk or it is already completed.
    async fn try_acquire(
        &self,
        worker: &str,
        range: HeightRange,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, IndexerError>;

    /// Mark a chunk completed if `holder` still owns its active lease.
    ///
    /// Returns `false` when the lease is gone or was reclaimed by another
    /// holder after it expired.
    async fn complete(&self, worker: &str, range_start: u64, holder: &str)
        -> Result<bool, IndexerError>;

    /// Drop an active lease held by `holder` so another claim can take it.
    async fn release(&self, worker: &str, range_start: u64, holder: &str)
        -> Result<bool, IndexerError>;

    /// Completed leases for `worker`, in no particular order.
    async fn completed(&self, worker: &str) -> Result<Vec<Lease>, IndexerError>;

    /// Active leases for `worker`, in no particular order.
    async fn active(&self, worker: &str) -> Result<Vec<Lease>, IndexerError>;

    /// Delete the given leases. Returns the number removed.
    async fn remove(&self, worker: &str, range_starts: &[u64]) -> Result<u64, IndexerError>;

    /// Delete completed leases that the checkpoint has already passed.
    async fn remove_behind(
        &self,
        worker: &str,
        checkpoint: u64,
        direction: Direction,
    ) -> Result<u64, IndexerError>;

    /// Delete every lease at or after `height`, whatever its status.
    async fn delete_from(
        &self,
        worker: &str,
        height: u64,
        direction: Direction,
    ) -> Result<u64, IndexerError>;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// In-memory lease table for tests and single-process pipelines.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<(String, u64), Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_status(&self, worker: &str, status: LeaseStatus) -> Vec<Lease> {
        self.leases
            .lock()
            .await
            .values()
            .filter(|l| l.worker == worker && l.status == status)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        worker: &str,
        range: HeightRange,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, IndexerError> {
        let now = Utc::now();
        let mut leases = self.leases.lock().await;
        let key = (worker.to_string(), range.start);

        let attempts = match leases.get(&key) {
            None => 1,
            Some(existing) if existing.is_expired(now) => existing.attempts + 1,
            Some(_) => return Ok(None),
        };

        let lease = Lease {
            worker: worker.to_string(),
            range,
            holder: holder.to_string(),
            status: LeaseStatus::Active,
            attempts,
            claimed_at: now,
            expires_at: now + ttl_to_chrono(ttl),
        };
        leases.insert(key, lease.clone());
        Ok(Some(lease))
    }

    async fn complete(
        &self,
        worker: &str,
        range_start: u64,
        holder: &str,
    ) -> Result<bool, IndexerError> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&(worker.to_string(), range_start)) {
            Some(lease) if lease.status == LeaseStatus::Active && lease.holder == holder => {
                lease.status = LeaseStatus::Completed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        worker: &str,
        range_start: u64,
        holder: &str,
    ) -> Result<bool, IndexerError> {
        let mut leases = self.leases.lock().await;
        let key = (worker.to_string(), range_start);
        let owned = leases
            .get(&key)
            .map(|l| l.status == LeaseStatus::Active && l.holder == holder)
            .unwrap_or(false);
        if owned {
            leases.remove(&key);
        }
        Ok(owned)
    }

    async fn completed(&self, worker: &str) -> Result<Vec<Lease>, IndexerError> {
        Ok(self.with_status(worker, LeaseStatus::Completed).await)
    }

    async fn active(&self, worker: &str) -> Result<Vec<Lease>, IndexerError> {
        Ok(self.with_status(worker, LeaseStatus::Active).await)
    }

    async fn remove(&self, worker: &str, range_starts: &[u64]) -> Result<u64, IndexerError> {
        let mut leases = self.leases.lock().await;
        let mut removed = 0;
        for start in range_starts {
            if leases.remove(&(worker.to_string(), *start)).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_behind(
        &self,
        worker: &str,
        checkpoint: u64,
        direction: Direction,
    ) -> Result<u64, IndexerError> {
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|_, l| {
            !(l.worker == worker
                && l.status == LeaseStatus::Completed
                && lease_behind(&l.range, checkpoint, direction))
        });
        Ok((before - leases.len()) as u64)
    }

    async fn delete_from(
        &self,
        worker: &str,
        height: u64,
        direction: Direction,
    ) -> Result<u64, IndexerError> {
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|_, l| !(l.worker == worker && lease_at_or_after(&l.range, height, direction)));
        Ok((before - leases.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn second_claim_on_same_chunk_fails() {
        let store = MemoryLeaseStore::new();
        let range = HeightRange::new(1_000, 2_000);
        assert!(store.try_acquire("w", range, "a", TTL).await.unwrap().is_some());
        assert!(store.try_acquire("w", range, "b", TTL).await.unwrap().is_none());
        // different worker, same chunk: independent
        assert!(store.try_acquire("other", range, "b", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryLeaseStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire("w", HeightRange::new(0, 1_000), &format!("holder-{i}"), TTL)
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_active_lease_is_reclaimable() {
        let store = MemoryLeaseStore::new();
        let range = HeightRange::new(0, 10);
        store.try_acquire("w", range, "crashed", Duration::ZERO).await.unwrap().unwrap();
        let lease = store.try_acquire("w", range, "rescuer", TTL).await.unwrap().unwrap();
        assert_eq!(lease.holder, "rescuer");
        assert_eq!(lease.attempts, 2);
    }

    #[tokio::test]
    async fn completed_lease_is_never_reclaimed() {
        let store = MemoryLeaseStore::new();
        let range = HeightRange::new(0, 10);
        store.try_acquire("w", range, "a", Duration::ZERO).await.unwrap();
        assert!(store.complete("w", 0, "a").await.unwrap());
        assert!(store.try_acquire("w", range, "b", TTL).await.unwrap().is_none());
        assert_eq!(store.completed("w").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reclaimed_lease_cannot_be_completed_by_old_holder() {
        let store = MemoryLeaseStore::new();
        let range = HeightRange::new(0, 10);
        store.try_acquire("w", range, "stalled", Duration::ZERO).await.unwrap().unwrap();
        store.try_acquire("w", range, "rescuer", TTL).await.unwrap().unwrap();

        assert!(!store.complete("w", 0, "stalled").await.unwrap());
        assert!(store.completed("w").await.unwrap().is_empty());
        assert!(store.complete("w", 0, "rescuer").await.unwrap());
        assert_eq!(store.completed("w").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let store = MemoryLeaseStore::new();
        store.try_acquire("w", HeightRange::new(0, 10), "a", TTL).await.unwrap();
        assert!(!store.release("w", 0, "b").await.unwrap());
        assert!(store.release("w", 0, "a").await.unwrap());
        assert!(store.active("w").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_from_respects_direction() {
        let store = MemoryLeaseStore::new();
        for start in [0u64, 10, 20, 30] {
            store.try_acquire("fwd", HeightRange::new(start, start + 10), "a", TTL).await.unwrap();
            store.try_acquire("bwd", HeightRange::new(start, start + 10), "a", TTL).await.unwrap();
        }
        assert_eq!(store.delete_from("fwd", 20, Direction::Forward).await.unwrap(), 2);
        assert_eq!(store.delete_from("bwd", 20, Direction::Backward).await.unwrap(), 2);

        let mut fwd: Vec<_> = store.active("fwd").await.unwrap().iter().map(|l| l.range.start).collect();
        fwd.sort();
        assert_eq!(fwd, vec![0, 10]);
        let mut bwd: Vec<_> = store.active("bwd").await.unwrap().iter().map(|l| l.range.start).collect();
        bwd.sort();
        assert_eq!(bwd, vec![20, 30]);
    }

    #[tokio::test]
    async fn remove_behind_keeps_active_and_ahead() {
        let store = MemoryLeaseStore::new();
        for start in [0u64, 10, 20] {
            store.try_acquire("w", HeightRange::new(start, start + 10), "a", TTL).await.unwrap();
        }
        store.complete("w", 0, "a").await.unwrap();
        store.complete("w", 20, "a").await.unwrap();
        assert_eq!(store.remove_behind("w", 20, Direction::Forward).await.unwrap(), 1);
        assert_eq!(store.active("w").await.unwrap().len(), 1);
        assert_eq!(store.completed("w").await.unwrap().len(), 1);
    }
}
