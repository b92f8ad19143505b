//! Lease/range scheduler.
//!
//! Partitions a worker's unindexed heights into fixed-size chunks, hands out
//! exclusive claims on them and advances the checkpoint once a contiguous run
//! of chunks has completed.
//!
//! ```text
//!  checkpoint                         watermark.high
//!      │                                    │
//!      ▼                                    ▼
//!      [ chunk 0 ][ chunk 1 ][ chunk 2 ][ chunk 3 ] ...
//!        active    completed   active    completed
//!
//!  fold: chunk 1 waits for chunk 0. Once chunk 0 completes the checkpoint
//!  jumps over 0 and 1 in one write and stops in front of chunk 2.
//! ```
//!
//! A forward worker also owns a backward cursor, [`history_cursor`], seeded
//! where its forward cursor started. Heights in `[history, checkpoint)` are
//! derived. Raw blocks the backward ingester adds below the history cursor
//! are picked up by a second, backward scheduler under that name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::WorkerSettings;
use crate::error::IndexerError;
use crate::lease::LeaseStore;
use crate::ledger::RawLedgerStore;
use crate::types::{align_down, Direction, HeightRange, Watermark};

/// Checkpoint name of a forward worker's history cursor.
pub fn history_cursor(worker: &str) -> String {
    format!("{worker}_history")
}

/// Compute what a worker may read right now.
///
/// The window is `[lowest raw height, ingester checkpoint)`, further capped by
/// each upstream worker's checkpoint. Empty while nothing is ingested. An
/// upstream worker whose coverage starts above the window also sets the
/// floor, so a new cursor never starts below what it has derived.
pub async fn visible_watermark(
    raw: &dyn RawLedgerStore,
    checkpoints: &dyn CheckpointStore,
    ingester: &str,
    dependencies: &[String],
) -> Result<Watermark, IndexerError> {
    let Some(low) = raw.lowest_height().await? else {
        return Ok(Watermark::empty());
    };
    let mut watermark = Watermark::new(low, checkpoints.get_height(ingester).await?);
    for dep in dependencies {
        watermark = watermark.cap(checkpoints.get_height(dep).await?);
        if let Some(history) = checkpoints.load(&history_cursor(dep)).await? {
            watermark = watermark.with_floor(history.height);
        }
    }
    Ok(watermark)
}

/// Window for a forward worker's history lane.
///
/// `[lowest raw height, worker checkpoint)`, never below `start_height`.
/// Each upstream worker bounds it to the heights that upstream has derived,
/// and an upstream without a history cursor closes it. Stays empty until the
/// worker's own forward cursor has seeded its history cursor.
pub async fn history_watermark(
    raw: &dyn RawLedgerStore,
    checkpoints: &dyn CheckpointStore,
    worker: &str,
    start_height: Option<u64>,
    dependencies: &[String],
) -> Result<Watermark, IndexerError> {
    let Some(low) = raw.lowest_height().await? else {
        return Ok(Watermark::empty());
    };
    let Some(live) = checkpoints.load(worker).await? else {
        return Ok(Watermark::empty());
    };
    if checkpoints.load(&history_cursor(worker)).await?.is_none() {
        return Ok(Watermark::empty());
    }
    let mut watermark = Watermark::new(low, live.height).raise(start_height.unwrap_or(0));
    for dep in dependencies {
        let Some(history) = checkpoints.load(&history_cursor(dep)).await? else {
            return Ok(Watermark::empty());
        };
        watermark = watermark
            .raise(history.height)
            .cap(checkpoints.get_height(dep).await?);
    }
    Ok(watermark)
}

/// Chunk scheduler for one worker.
pub struct RangeScheduler {
    worker: String,
    direction: Direction,
    range_size: u64,
    start_height: Option<u64>,
    lookahead: usize,
    lease_ttl: Duration,
    holder: String,
    checkpoints: Arc<dyn CheckpointStore>,
    leases: Arc<dyn LeaseStore>,
}

impl RangeScheduler {
    pub fn new(
        worker: impl Into<String>,
        settings: &WorkerSettings,
        lease_ttl: Duration,
        holder: impl Into<String>,
        checkpoints: Arc<dyn CheckpointStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            worker: worker.into(),
            direction: settings.direction,
            range_size: settings.range_size.max(1),
            start_height: settings.start_height,
            lookahead: settings.lookahead(),
            lease_ttl,
            holder: holder.into(),
            checkpoints,
            leases,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Current cursor, creating it from the watermark on first use.
    ///
    /// Returns `None` while the watermark is empty. A forward cursor that
    /// lags behind the lowest ingested height is moved up to it, since there
    /// is nothing to read below. Forward cursors keep their
    /// [`history_cursor`] at or below the point they started from.
    pub async fn cursor(&self, watermark: Watermark) -> Result<Option<u64>, IndexerError> {
        if let Some(cp) = self.checkpoints.load(&self.worker).await? {
            if self.direction == Direction::Forward && !watermark.is_empty() {
                let floor = align_down(watermark.low, self.range_size).max(watermark.floor);
                if cp.height < floor {
                    info!(worker = %self.worker, from = cp.height, to = floor, "fast-forwarding to lowest ingested height");
                    self.checkpoints
                        .advance_checkpoint(&self.worker, floor, self.direction)
                        .await?;
                    let height = self.checkpoints.get_height(&self.worker).await?;
                    self.restart_history(height).await?;
                    return Ok(Some(height));
                }
            }
            return Ok(Some(cp.height));
        }
        if watermark.is_empty() {
            return Ok(None);
        }

        let initial = match self.direction {
            Direction::Forward => {
                align_down(self.start_height.unwrap_or(watermark.low), self.range_size)
                    .max(watermark.floor)
            }
            Direction::Backward => self.start_height.unwrap_or(watermark.high),
        };
        self.checkpoints
            .advance_checkpoint(&self.worker, initial, self.direction)
            .await?;
        // Another replica may have initialized first.
        let height = self.checkpoints.get_height(&self.worker).await?;
        if self.direction == Direction::Forward {
            self.checkpoints
                .advance_checkpoint(&history_cursor(&self.worker), height, Direction::Backward)
                .await?;
        }
        info!(worker = %self.worker, height, direction = %self.direction, "initialized checkpoint");
        Ok(Some(height))
    }

    /// After a fast-forward the heights between the old and new cursor were
    /// never derived, so history has to start over from the new cursor.
    async fn restart_history(&self, height: u64) -> Result<(), IndexerError> {
        let name = history_cursor(&self.worker);
        match self.checkpoints.load(&name).await? {
            Some(history) if history.height >= height => {}
            _ => {
                self.checkpoints.set_checkpoint(&name, height).await?;
                self.leases.delete_from(&name, 0, Direction::Forward).await?;
            }
        }
        Ok(())
    }

    /// Chunks eligible for claiming, nearest to the cursor first.
    ///
    /// Forward chunks must lie fully below `watermark.high`. Backward chunks
    /// are clipped at `watermark.low`, so the oldest chunk may be short.
    pub fn candidates(&self, cursor: u64, watermark: Watermark) -> Vec<HeightRange> {
        let mut out = Vec::with_capacity(self.lookahead);
        for i in 0..self.lookahead as u64 {
            let offset = i * self.range_size;
            let range = match self.direction {
                Direction::Forward => {
                    let start = cursor + offset;
                    let end = start + self.range_size;
                    if end > watermark.high {
                        break;
                    }
                    HeightRange::new(start, end)
                }
                Direction::Backward => {
                    let end = cursor.saturating_sub(offset).min(watermark.high);
                    if end <= watermark.low {
                        break;
                    }
                    HeightRange::new(end.saturating_sub(self.range_size).max(watermark.low), end)
                }
            };
            out.push(range);
        }
        out
    }

    /// Claim up to `max` chunks. Chunks leased by anyone else are skipped.
    pub async fn claim(
        &self,
        watermark: Watermark,
        max: usize,
    ) -> Result<Vec<HeightRange>, IndexerError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let Some(cursor) = self.cursor(watermark).await? else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for range in self.candidates(cursor, watermark) {
            if claimed.len() == max {
                break;
            }
            if let Some(lease) = self
                .leases
                .try_acquire(&self.worker, range, &self.holder, self.lease_ttl)
                .await?
            {
                debug!(worker = %self.worker, %range, attempt = lease.attempts, "claimed chunk");
                claimed.push(range);
            }
        }
        Ok(claimed)
    }

    /// Mark a chunk done. The checkpoint moves on the next [`fold`](Self::fold).
    pub async fn complete(&self, range: HeightRange) -> Result<(), IndexerError> {
        if !self
            .leases
            .complete(&self.worker, range.start, &self.holder)
            .await?
        {
            warn!(worker = %self.worker, %range, holder = %self.holder, "lease lost before completion, chunk left to its new holder");
        }
        Ok(())
    }

    /// Give a claimed chunk back without completing it.
    pub async fn release(&self, range: HeightRange) -> Result<(), IndexerError> {
        self.leases.release(&self.worker, range.start, &self.holder).await?;
        Ok(())
    }

    /// Advance the checkpoint over the contiguous run of completed chunks.
    ///
    /// Returns the new height if the checkpoint moved.
    pub async fn fold(&self) -> Result<Option<u64>, IndexerError> {
        let Some(cp) = self.checkpoints.load(&self.worker).await? else {
            return Ok(None);
        };
        let completed = self.leases.completed(&self.worker).await?;

        // forward chunks chain start → end, backward chunks chain end → start
        let links: HashMap<u64, HeightRange> = completed
            .iter()
            .filter(|l| !l.range.is_empty())
            .map(|l| match self.direction {
                Direction::Forward => (l.range.start, l.range),
                Direction::Backward => (l.range.end, l.range),
            })
            .collect();

        let mut cursor = cp.height;
        let mut folded = Vec::new();
        while let Some(range) = links.get(&cursor) {
            folded.push(range.start);
            cursor = match self.direction {
                Direction::Forward => range.end,
                Direction::Backward => range.start,
            };
        }

        if folded.is_empty() {
            self.leases
                .remove_behind(&self.worker, cp.height, self.direction)
                .await?;
            return Ok(None);
        }

        let moved = self
            .checkpoints
            .advance_checkpoint(&self.worker, cursor, self.direction)
            .await?;
        self.leases.remove(&self.worker, &folded).await?;
        self.leases
            .remove_behind(&self.worker, cursor, self.direction)
            .await?;

        if moved {
            info!(
                worker = %self.worker,
                from = cp.height,
                to = cursor,
                chunks = folded.len(),
                "checkpoint advanced"
            );
            Ok(Some(cursor))
        } else {
            Ok(None)
        }
    }
}
