//! Token catalog maintained from already-derived transfers.
//!
//! Metadata (name, symbol, decimals) is filled later by the enricher; this
//! worker only records which contracts exist and where they were seen.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use ledgermirror_core::derived::{DerivedStore, TokenKind, TokenSighting, TokenTransfer};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

pub const META_WORKER: &str = "meta_worker";

/// First and last sighting per contract.
pub fn catalog_sightings(transfers: &[TokenTransfer]) -> Vec<TokenSighting> {
    let mut spans: BTreeMap<&str, (TokenKind, u64, u64)> = BTreeMap::new();
    for t in transfers {
        let kind = if t.is_nft { TokenKind::NonFungible } else { TokenKind::Fungible };
        spans
            .entry(t.contract.as_str())
            .and_modify(|(_, lo, hi)| {
                *lo = (*lo).min(t.block_height);
                *hi = (*hi).max(t.block_height);
            })
            .or_insert((kind, t.block_height, t.block_height));
    }

    let mut out = Vec::with_capacity(spans.len() * 2);
    for (contract, (kind, lo, hi)) in spans {
        out.push(TokenSighting { contract: contract.to_string(), kind, height: lo });
        if hi != lo {
            out.push(TokenSighting { contract: contract.to_string(), kind, height: hi });
        }
    }
    out
}

pub struct MetaWorker {
    derived: Arc<dyn DerivedStore>,
}

impl MetaWorker {
    pub fn new(derived: Arc<dyn DerivedStore>) -> Self {
        Self { derived }
    }
}

#[async_trait]
impl Processor for MetaWorker {
    fn name(&self) -> &str {
        META_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let transfers = self
            .derived
            .token_transfers_in_range(HeightRange::new(from, to))
            .await?;
        let rows = catalog_sightings(&transfers);
        if !rows.is_empty() {
            self.derived.upsert_token_catalog(&rows).await?;
        }
        debug!(worker = META_WORKER, from, to, contracts = rows.len(), "token catalog updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testutil::transfer;

    #[test]
    fn spans_cover_first_and_last_height() {
        let rows = catalog_sightings(&[
            transfer(10, "a.Coin", Some("01"), Some("02"), "1"),
            transfer(30, "a.Coin", Some("02"), Some("03"), "1"),
            transfer(20, "a.Coin", Some("03"), Some("01"), "1"),
        ]);
        let heights: Vec<u64> = rows.iter().map(|s| s.height).collect();
        assert_eq!(heights, vec![10, 30]);
        assert!(rows.iter().all(|s| s.kind == TokenKind::Fungible));
    }
}
