//! Account catalog: every address that created, paid for, proposed or
//! authorized a transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use ledgermirror_core::derived::{AccountSighting, DerivedStore};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::{LedgerBlock, RawLedgerStore};
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

use crate::payload::{event_fields, field_address, normalize_address};

pub const ACCOUNTS_WORKER: &str = "accounts_worker";

const ACCOUNT_CREATED: &str = "flow.AccountCreated";

/// One sighting per address and height; creation wins over plain activity.
pub fn sightings(blocks: &[LedgerBlock]) -> Result<Vec<AccountSighting>, IndexerError> {
    let mut seen: BTreeMap<(String, u64), bool> = BTreeMap::new();
    let mut add = |addr: &str, height: u64, created: bool| {
        if let Some(address) = normalize_address(addr) {
            let entry = seen.entry((address, height)).or_default();
            *entry |= created;
        }
    };

    for block in blocks {
        for event in block.events.iter().filter(|e| e.event_type == ACCOUNT_CREATED) {
            let fields = event_fields(event)?;
            if let Some(address) = field_address(&fields, &["address"]) {
                add(&address, event.block_height, true);
            }
        }
        for tx in &block.transactions {
            add(&tx.payer, block.height, false);
            add(&tx.proposer, block.height, false);
            for authorizer in &tx.authorizers {
                add(authorizer, block.height, false);
            }
        }
    }

    Ok(seen
        .into_iter()
        .map(|((address, height), created)| AccountSighting { address, height, created })
        .collect())
}

pub struct AccountsWorker {
    raw: Arc<dyn RawLedgerStore>,
    derived: Arc<dyn DerivedStore>,
}

impl AccountsWorker {
    pub fn new(raw: Arc<dyn RawLedgerStore>, derived: Arc<dyn DerivedStore>) -> Self {
        Self { raw, derived }
    }
}

#[async_trait]
impl Processor for AccountsWorker {
    fn name(&self) -> &str {
        ACCOUNTS_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let blocks = self.raw.blocks_in_range(HeightRange::new(from, to)).await?;
        let rows = sightings(&blocks)?;
        self.derived.upsert_accounts(&rows).await?;
        debug!(worker = ACCOUNTS_WORKER, from, to, sightings = rows.len(), "accounts merged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testutil::{block, event, tx};
    use serde_json::json;

    #[test]
    fn collects_creations_and_participants() {
        let mut b = block(7);
        b.transactions.push(tx(7, "t1", "0xAA", &["0xBB", "0xaa"]));
        b.events.push(event(7, "t1", 0, ACCOUNT_CREATED, json!({"address": "0xCC"})));

        let rows = sightings(&[b]).unwrap();
        let addrs: Vec<(&str, bool)> = rows.iter().map(|s| (s.address.as_str(), s.created)).collect();
        assert_eq!(addrs, vec![("aa", false), ("bb", false), ("cc", true)]);
    }
}
