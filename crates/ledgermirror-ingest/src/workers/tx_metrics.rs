//! Per-block transaction, event and gas counters.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use ledgermirror_core::derived::{BlockMetrics, DerivedStore};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::{LedgerBlock, RawLedgerStore};
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

pub const TX_METRICS_WORKER: &str = "tx_metrics_worker";

pub fn block_metrics(block: &LedgerBlock) -> BlockMetrics {
    BlockMetrics {
        height: block.height,
        timestamp: block.timestamp,
        tx_count: block.transactions.len() as u64,
        failed_tx_count: block.transactions.iter().filter(|t| t.is_failed()).count() as u64,
        event_count: block.events.len() as u64,
        total_gas: block.transactions.iter().map(|t| t.gas_used).sum(),
    }
}

pub struct TxMetricsWorker {
    raw: Arc<dyn RawLedgerStore>,
    derived: Arc<dyn DerivedStore>,
}

impl TxMetricsWorker {
    pub fn new(raw: Arc<dyn RawLedgerStore>, derived: Arc<dyn DerivedStore>) -> Self {
        Self { raw, derived }
    }
}

#[async_trait]
impl Processor for TxMetricsWorker {
    fn name(&self) -> &str {
        TX_METRICS_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let blocks = self.raw.blocks_in_range(HeightRange::new(from, to)).await?;
        let rows: Vec<BlockMetrics> = blocks.iter().map(block_metrics).collect();
        self.derived.upsert_block_metrics(&rows).await?;
        debug!(worker = TX_METRICS_WORKER, from, to, blocks = rows.len(), "block metrics upserted");
        Ok(())
    }
}
