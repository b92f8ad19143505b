//! Current NFT owners, last write by height wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use ledgermirror_core::derived::{DerivedStore, NftOwnership, TokenTransfer};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

use super::token::is_wrapper_contract;

pub const NFT_OWNERSHIP_WORKER: &str = "nft_ownership_worker";

/// Storefront custody account; deposits into it are listings, not sales.
pub const CUSTODIAL_ADDRESS: &str = "e1f2a091f7bb5245";

/// Latest owner per NFT within `transfers`.
pub fn latest_owners(transfers: &[TokenTransfer]) -> Vec<NftOwnership> {
    let mut owners: BTreeMap<(&str, &str), NftOwnership> = BTreeMap::new();
    for t in transfers.iter().filter(|t| t.is_nft) {
        let (Some(nft_id), Some(owner)) = (t.token_id.as_deref(), t.to.as_deref()) else {
            continue;
        };
        let name = t.contract.rsplit('.').next().unwrap_or_default();
        if is_wrapper_contract(name) || owner == CUSTODIAL_ADDRESS {
            continue;
        }
        // transfers arrive in (height, tx, event) order
        owners.insert(
            (t.contract.as_str(), nft_id),
            NftOwnership {
                contract: t.contract.clone(),
                nft_id: nft_id.to_string(),
                owner: owner.to_string(),
                last_height: t.block_height,
            },
        );
    }
    owners.into_values().collect()
}

pub struct NftOwnershipWorker {
    derived: Arc<dyn DerivedStore>,
}

impl NftOwnershipWorker {
    pub fn new(derived: Arc<dyn DerivedStore>) -> Self {
        Self { derived }
    }
}

#[async_trait]
impl Processor for NftOwnershipWorker {
    fn name(&self) -> &str {
        NFT_OWNERSHIP_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let transfers = self
            .derived
            .token_transfers_in_range(HeightRange::new(from, to))
            .await?;
        let rows = latest_owners(&transfers);
        self.derived.upsert_nft_ownership(&rows).await?;
        debug!(worker = NFT_OWNERSHIP_WORKER, from, to, rows = rows.len(), "nft owners upserted");
        Ok(())
    }
}
