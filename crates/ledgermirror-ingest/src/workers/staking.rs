//! Staking and epoch events as an append-only log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use ledgermirror_core::derived::{DerivedStore, StakingEvent};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::{LedgerEvent, RawLedgerStore};
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

use crate::payload::{event_fields, field_str, parse_amount};

pub const STAKING_WORKER: &str = "staking_worker";

pub fn is_staking_event(event_type: &str) -> bool {
    event_type.contains(".FlowIDTableStaking.") || event_type.contains(".FlowEpoch.")
}

pub fn parse_staking(
    event: &LedgerEvent,
    timestamp: DateTime<Utc>,
) -> Result<StakingEvent, IndexerError> {
    let fields = event_fields(event)?;
    let amount = field_str(&fields, "amount").map(|a| parse_amount(&a)).transpose()?;
    Ok(StakingEvent {
        block_height: event.block_height,
        tx_id: event.tx_id.clone(),
        event_index: event.event_index,
        event_name: event.event_name().to_string(),
        node_id: field_str(&fields, "nodeID"),
        delegator_id: field_str(&fields, "delegatorID"),
        amount,
        timestamp,
    })
}

pub struct StakingWorker {
    raw: Arc<dyn RawLedgerStore>,
    derived: Arc<dyn DerivedStore>,
}

impl StakingWorker {
    pub fn new(raw: Arc<dyn RawLedgerStore>, derived: Arc<dyn DerivedStore>) -> Self {
        Self { raw, derived }
    }
}

#[async_trait]
impl Processor for StakingWorker {
    fn name(&self) -> &str {
        STAKING_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let range = HeightRange::new(from, to);
        let blocks = self.raw.blocks_in_range(range).await?;
        let mut rows = Vec::new();
        for block in &blocks {
            for event in block.events.iter().filter(|e| is_staking_event(&e.event_type)) {
                rows.push(parse_staking(event, block.timestamp)?);
            }
        }
        let deleted = self.derived.replace_staking_events(range, &rows).await?;
        debug!(worker = STAKING_WORKER, from, to, rows = rows.len(), deleted, "staking events written");
        Ok(())
    }
}
