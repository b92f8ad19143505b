//! Fungible holdings as per-block net balance deltas.
//!
//! A holder's balance is the sum of its deltas, so rewriting one chunk's
//! deltas never disturbs balances contributed by other chunks.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use ledgermirror_core::derived::{DerivedStore, FtHoldingDelta, TokenTransfer};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

pub const FT_HOLDINGS_WORKER: &str = "ft_holdings_worker";

pub fn net_deltas(transfers: &[TokenTransfer]) -> Vec<FtHoldingDelta> {
    let mut net: BTreeMap<(u64, &str, &str), Decimal> = BTreeMap::new();
    for t in transfers.iter().filter(|t| !t.is_nft) {
        if let Some(from) = t.from.as_deref() {
            *net.entry((t.block_height, from, t.contract.as_str())).or_default() -= t.amount;
        }
        if let Some(to) = t.to.as_deref() {
            *net.entry((t.block_height, to, t.contract.as_str())).or_default() += t.amount;
        }
    }
    net.into_iter()
        .filter(|(_, delta)| !delta.is_zero())
        .map(|((block_height, address, contract), delta)| FtHoldingDelta {
            block_height,
            address: address.to_string(),
            contract: contract.to_string(),
            delta,
        })
        .collect()
}

pub struct FtHoldingsWorker {
    derived: Arc<dyn DerivedStore>,
}

impl FtHoldingsWorker {
    pub fn new(derived: Arc<dyn DerivedStore>) -> Self {
        Self { derived }
    }
}

#[async_trait]
impl Processor for FtHoldingsWorker {
    fn name(&self) -> &str {
        FT_HOLDINGS_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let range = HeightRange::new(from, to);
        let transfers = self.derived.token_transfers_in_range(range).await?;
        let rows = net_deltas(&transfers);
        let deleted = self.derived.replace_ft_deltas(range, &rows).await?;
        debug!(worker = FT_HOLDINGS_WORKER, from, to, rows = rows.len(), deleted, "holding deltas written");
        Ok(())
    }
}
