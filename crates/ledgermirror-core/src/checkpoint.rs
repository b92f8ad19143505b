//! Checkpoint store: durable per-worker progress cursors.
//!
//! A forward checkpoint is the first height not yet processed, so every height
//! in `[origin, checkpoint)` is done. A backward checkpoint is the lowest
//! processed height. Workers only move their cursor through
//! [`CheckpointStore::advance_checkpoint`], which refuses to move it the wrong
//! way. Recovery tooling is the only caller of the unconditional
//! [`CheckpointStore::set_checkpoint`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::IndexerError;
use crate::types::Direction;

/// A persisted progress cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub worker: String,
    pub height: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(worker: impl Into<String>, height: u64) -> Self {
        Self {
            worker: worker.into(),
            height,
            updated_at: Utc::now(),
        }
    }
}

/// Trait for storing and loading checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint row, or `None` if the worker never ran.
    async fn load(&self, worker: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Current height, `0` for a worker that was never initialized.
    async fn get_height(&self, worker: &str) -> Result<u64, IndexerError> {
        Ok(self.load(worker).await?.map(|cp| cp.height).unwrap_or(0))
    }

    /// Unconditional overwrite. Bypasses the monotonic guard.
    async fn set_checkpoint(&self, worker: &str, height: u64) -> Result<(), IndexerError>;

    /// Move the cursor to `height` only if that is a legal move for `direction`.
    ///
    /// A missing row is always initialized. Returns `true` if the stored
    /// height changed.
    async fn advance_checkpoint(
        &self,
        worker: &str,
        height: u64,
        direction: Direction,
    ) -> Result<bool, IndexerError>;

    /// All known checkpoints, ordered by worker name.
    async fn list(&self) -> Result<Vec<Checkpoint>, IndexerError>;
}

/// Apply the advance rule to an optional current value.
pub fn advance_allowed(current: Option<u64>, next: u64, direction: Direction) -> bool {
    match current {
        None => true,
        Some(cur) => direction.is_advance(cur, next),
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral pipelines.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, worker: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.data.lock().await.get(worker).cloned())
    }

    async fn set_checkpoint(&self, worker: &str, height: u64) -> Result<(), IndexerError> {
        self.data
            .lock()
            .await
            .insert(worker.to_string(), Checkpoint::new(worker, height));
        Ok(())
    }

    async fn advance_checkpoint(
        &self,
        worker: &str,
        height: u64,
        direction: Direction,
    ) -> Result<bool, IndexerError> {
        let mut data = self.data.lock().await;
        let current = data.get(worker).map(|cp| cp.height);
        if !advance_allowed(current, height, direction) {
            return Ok(false);
        }
        data.insert(worker.to_string(), Checkpoint::new(worker, height));
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        let mut out: Vec<Checkpoint> = self.data.lock().await.values().cloned().collect();
        out.sort_by(|a, b| a.worker.cmp(&b.worker));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn uninitialized_worker_reads_zero() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("token_worker").await.unwrap().is_none());
        assert_eq!(store.get_height("token_worker").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn forward_advance_is_monotonic() {
        let store = MemoryCheckpointStore::new();
        assert!(store.advance_checkpoint("w", 1_000, Direction::Forward).await.unwrap());
        assert!(store.advance_checkpoint("w", 3_000, Direction::Forward).await.unwrap());
        assert!(!store.advance_checkpoint("w", 2_000, Direction::Forward).await.unwrap());
        assert!(!store.advance_checkpoint("w", 3_000, Direction::Forward).await.unwrap());
        assert_eq!(store.get_height("w").await.unwrap(), 3_000);
    }

    #[tokio::test]
    async fn backward_advance_is_monotonic() {
        let store = MemoryCheckpointStore::new();
        assert!(store.advance_checkpoint("hist", 50_000, Direction::Backward).await.unwrap());
        assert!(store.advance_checkpoint("hist", 49_000, Direction::Backward).await.unwrap());
        assert!(!store.advance_checkpoint("hist", 49_500, Direction::Backward).await.unwrap());
        assert_eq!(store.get_height("hist").await.unwrap(), 49_000);
    }

    #[tokio::test]
    async fn backward_cursor_can_reach_zero() {
        let store = MemoryCheckpointStore::new();
        store.advance_checkpoint("hist", 10, Direction::Backward).await.unwrap();
        assert!(store.advance_checkpoint("hist", 0, Direction::Backward).await.unwrap());
        let cp = store.load("hist").await.unwrap().unwrap();
        assert_eq!(cp.height, 0);
    }

    #[tokio::test]
    async fn set_checkpoint_bypasses_guard() {
        let store = MemoryCheckpointStore::new();
        store.advance_checkpoint("w", 9_000, Direction::Forward).await.unwrap();
        store.set_checkpoint("w", 4_000).await.unwrap();
        assert_eq!(store.get_height("w").await.unwrap(), 4_000);
    }

    #[tokio::test]
    async fn concurrent_advances_never_regress() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut handles = Vec::new();
        for h in [5u64, 1, 9, 3, 7, 2, 8, 4, 6] {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.advance_checkpoint("w", h * 1_000, Direction::Forward).await.unwrap();
                store.get_height("w").await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get_height("w").await.unwrap(), 9_000);
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let store = MemoryCheckpointStore::new();
        store.set_checkpoint("token_worker", 1).await.unwrap();
        store.set_checkpoint("accounts_worker", 2).await.unwrap();
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|c| c.worker).collect();
        assert_eq!(names, vec!["accounts_worker", "token_worker"]);
    }
}
