//! Raw ledger ingesters.
//!
//! The forward ingester follows the chain tip; the backward ingester fills
//! history below its cursor down to a floor. Each batch is fetched with
//! bounded parallelism and saved together with the checkpoint move, so the
//! checkpoint never runs ahead of the stored blocks.
//!
//! A height that still fails transiently after the reader's retries ends the
//! batch in front of it and is fetched again next step. Only a permanently
//! unreadable height is recorded as an error plus a one-block skipped range.
//! Parent-link mismatches are logged and recorded but never block progress.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledgermirror_core::config::IngesterSettings;
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::hub::{FanoutHub, HubEvent};
use ledgermirror_core::ledger::{CheckpointUpdate, LedgerBlock};
use ledgermirror_core::types::{Direction, HeightRange};

use crate::reader::ChainReader;
use crate::stores::Stores;

/// Result of one ingest step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum IngestStep {
    /// A batch was committed.
    Advanced {
        range: HeightRange,
        blocks: usize,
        gaps: usize,
    },
    /// Nothing to fetch yet.
    Waiting,
    /// Backward ingester reached its floor.
    Finished,
}

/// Shrink forward batches near the tip so new blocks land quickly.
pub fn adaptive_batch(behind: u64, batch_size: u64) -> u64 {
    let size = match behind {
        0 => 0,
        1..=3 => 1,
        4..=20 => 5,
        21..=100 => 10,
        _ => batch_size,
    };
    size.min(batch_size.max(1)).min(behind)
}

pub struct RawIngester {
    name: String,
    direction: Direction,
    settings: IngesterSettings,
    reader: Arc<dyn ChainReader>,
    stores: Stores,
    hub: Option<FanoutHub>,
}

impl RawIngester {
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        settings: IngesterSettings,
        reader: Arc<dyn ChainReader>,
        stores: Stores,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            settings,
            reader,
            stores,
            hub: None,
        }
    }

    pub fn with_hub(mut self, hub: FanoutHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Load the cursor, creating it on first run.
    async fn cursor(&self) -> Result<Option<u64>, IndexerError> {
        if let Some(cp) = self.stores.checkpoints.load(&self.name).await? {
            return Ok(Some(cp.height));
        }
        let initial = match (self.settings.start_height, self.direction) {
            (Some(h), _) => h,
            (None, Direction::Forward) => self.reader.latest_height().await?,
            (None, Direction::Backward) => match self.stores.raw.lowest_height().await? {
                Some(h) => h,
                None => return Ok(None),
            },
        };
        self.stores
            .checkpoints
            .advance_checkpoint(&self.name, initial, self.direction)
            .await?;
        let height = self.stores.checkpoints.get_height(&self.name).await?;
        info!(ingester = %self.name, height, direction = %self.direction, "initialized ingester checkpoint");
        Ok(Some(height))
    }

    /// Fetch, verify and commit one batch.
    pub async fn run_once(&self) -> Result<IngestStep, IndexerError> {
        let Some(cursor) = self.cursor().await? else {
            return Ok(IngestStep::Waiting);
        };

        let range = match self.direction {
            Direction::Forward => {
                let tip = self.reader.latest_height().await?;
                if cursor > tip {
                    return Ok(IngestStep::Waiting);
                }
                let batch = adaptive_batch(tip - cursor + 1, self.settings.batch_size);
                HeightRange::new(cursor, cursor + batch)
            }
            Direction::Backward => {
                let floor = self.settings.floor;
                if cursor <= floor {
                    return Ok(IngestStep::Finished);
                }
                let batch = self.settings.batch_size.max(1).min(cursor - floor);
                HeightRange::new(cursor - batch, cursor)
            }
        };

        let (blocks, gaps, range) = self.fetch(range).await?;
        if range.is_empty() {
            return Ok(IngestStep::Waiting);
        }
        self.verify_links(&blocks, range).await?;

        let target = match self.direction {
            Direction::Forward => range.end,
            Direction::Backward => range.start,
        };
        let moved = self
            .stores
            .raw
            .save_batch(
                &blocks,
                CheckpointUpdate {
                    worker: self.name.clone(),
                    height: target,
                    direction: self.direction,
                },
            )
            .await?;
        if !moved {
            debug!(ingester = %self.name, %range, "checkpoint already past batch");
        }

        self.publish(&blocks, range);
        debug!(ingester = %self.name, %range, blocks = blocks.len(), gaps, "batch committed");
        Ok(IngestStep::Advanced {
            range,
            blocks: blocks.len(),
            gaps,
        })
    }

    /// Fetch every height of `range` in parallel, in height order.
    ///
    /// The committed range ends at the first height that cannot be read yet:
    /// one not produced (forward only) or one that still fails transiently
    /// after the reader's retries. Forward keeps the heights below that point,
    /// backward keeps the heights above it, so the cursor stops right in
    /// front of it. Only permanent errors become one-block gaps.
    async fn fetch(
        &self,
        range: HeightRange,
    ) -> Result<(Vec<LedgerBlock>, usize, HeightRange), IndexerError> {
        let reader = &self.reader;
        let mut results: Vec<(u64, Result<Option<LedgerBlock>, IndexerError>)> =
            futures::stream::iter(range.start..range.end)
                .map(|h| async move { (h, reader.block(h).await) })
                .buffered(self.settings.fetch_concurrency.max(1))
                .collect()
                .await;

        let mut kept = range;
        let mut cause = None;
        for (i, (h, result)) in results.iter().enumerate() {
            let stops = match result {
                Ok(Some(_)) => false,
                Ok(None) => self.direction == Direction::Forward,
                Err(e) => e.is_transient(),
            };
            if !stops {
                continue;
            }
            match self.direction {
                Direction::Forward if *h < kept.end => kept.end = *h,
                Direction::Backward if *h >= kept.start => kept.start = h + 1,
                _ => continue,
            }
            cause = result.is_err().then_some(i);
        }

        if let Some(i) = cause {
            let (h, result) = results.swap_remove(i);
            if let Err(e) = result {
                if kept.is_empty() {
                    return Err(e);
                }
                warn!(ingester = %self.name, height = h, %kept, error = %e, "read failed, committing up to it");
            }
        }

        let mut blocks = Vec::with_capacity(results.len());
        let mut gaps = 0;
        for (h, result) in results {
            if !kept.contains(h) {
                continue;
            }
            match result {
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => {
                    self.record_gap(h, "block missing below the tip").await?;
                    gaps += 1;
                }
                Err(e) => {
                    self.record_gap(h, &e.to_string()).await?;
                    gaps += 1;
                }
            }
        }
        blocks.sort_by_key(|b| b.height);
        Ok((blocks, gaps, kept))
    }

    async fn record_gap(&self, height: u64, reason: &str) -> Result<(), IndexerError> {
        let gap = HeightRange::new(height, height + 1);
        warn!(ingester = %self.name, height, %reason, "skipping unreadable block");
        self.stores.tracker.record_error(&self.name, gap, reason).await?;
        self.stores.tracker.record_skipped_range(&self.name, gap, reason).await
    }

    /// Check parent links inside the batch and against the stored neighbour.
    async fn verify_links(
        &self,
        blocks: &[LedgerBlock],
        range: HeightRange,
    ) -> Result<(), IndexerError> {
        let mut mismatches = Vec::new();
        for pair in blocks.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            if upper.height == lower.height + 1 && upper.parent_id != lower.id {
                mismatches.push((upper.height, upper.parent_id.clone(), lower.id.clone()));
            }
        }

        match self.direction {
            Direction::Forward => {
                if let (Some(first), Some(start)) = (blocks.first(), range.start.checked_sub(1)) {
                    if first.height == range.start {
                        if let Some(prev) = self.stores.raw.block(start).await? {
                            if first.parent_id != prev.id {
                                mismatches.push((first.height, first.parent_id.clone(), prev.id));
                            }
                        }
                    }
                }
            }
            Direction::Backward => {
                if let Some(last) = blocks.last().filter(|b| b.height + 1 == range.end) {
                    if let Some(next) = self.stores.raw.block(range.end).await? {
                        if next.parent_id != last.id {
                            mismatches.push((next.height, next.parent_id, last.id.clone()));
                        }
                    }
                }
            }
        }

        for (height, parent, expected) in mismatches {
            let message = format!("parent mismatch at {height}: parent_id {parent}, stored {expected}");
            warn!(ingester = %self.name, height, %parent, %expected, "parent link mismatch");
            self.stores
                .tracker
                .record_error(&self.name, HeightRange::new(height, height + 1), &message)
                .await?;
        }
        Ok(())
    }

    fn publish(&self, blocks: &[LedgerBlock], range: HeightRange) {
        let Some(hub) = &self.hub else {
            return;
        };
        if self.direction == Direction::Forward {
            for block in blocks {
                hub.publish(HubEvent::NewBlock(block.summary()));
                for tx in &block.transactions {
                    hub.publish(HubEvent::NewTransaction {
                        id: tx.id.clone(),
                        block_height: tx.block_height,
                        payer: tx.payer.clone(),
                        status: tx.status.clone(),
                    });
                }
            }
        }
        hub.publish(HubEvent::IndexedRange {
            source: self.name.clone(),
            direction: self.direction,
            range,
        });
    }

    /// Ingest until cancelled or, for a backward ingester, until the floor.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), IndexerError> {
        info!(
            ingester = %self.name,
            direction = %self.direction,
            batch_size = self.settings.batch_size,
            fetch_concurrency = self.settings.fetch_concurrency,
            "ingester started"
        );
        while !cancel.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(IngestStep::Advanced { .. }) => false,
                Ok(IngestStep::Waiting) => true,
                Ok(IngestStep::Finished) => {
                    info!(ingester = %self.name, floor = self.settings.floor, "backfill reached floor");
                    break;
                }
                Err(e) => {
                    warn!(ingester = %self.name, error = %e, "ingest step failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                }
            }
        }
        info!(ingester = %self.name, "ingester stopped");
        Ok(())
    }
}
