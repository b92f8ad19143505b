//! In-memory storage backend.
//!
//! Holds checkpoints, leases, the error ledger, raw blocks and every derived
//! table in RAM. Useful for tests and short-lived pipelines that don't need
//! persistence.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use ledgermirror_core::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
use ledgermirror_core::derived::{
    Account, AccountKey, AccountSighting, BlockMetrics, DailyStats, DerivedStore, EvmTransaction,
    FtHoldingDelta, NftOwnership, StakingEvent, TokenCatalogEntry, TokenMetadata, TokenSighting,
    TokenTransfer, TxContractTag,
};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::lease::{Lease, LeaseStore, MemoryLeaseStore};
use ledgermirror_core::ledger::{CheckpointUpdate, LedgerBlock, RawLedgerStore};
use ledgermirror_core::tracker::{
    ErrorLedger, ErrorReport, MemoryErrorLedger, ResolveReport, SkippedRange,
};
use ledgermirror_core::types::{Direction, HeightRange};

/// Every derived table, comparable as a whole for idempotence checks.
///
/// Log-shaped tables are plain vectors kept in key order, so duplicate rows
/// from a bad run are representable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DerivedTables {
    pub token_transfers: Vec<TokenTransfer>,
    pub evm_transactions: BTreeMap<String, EvmTransaction>,
    pub accounts: BTreeMap<String, Account>,
    pub ft_holding_deltas: Vec<FtHoldingDelta>,
    pub nft_ownership: BTreeMap<(String, String), NftOwnership>,
    pub tx_contract_tags: Vec<TxContractTag>,
    pub block_metrics: BTreeMap<u64, BlockMetrics>,
    pub daily_stats: BTreeMap<NaiveDate, DailyStats>,
    pub staking_events: Vec<StakingEvent>,
    pub account_keys: BTreeMap<(String, u32), AccountKey>,
    pub token_catalog: BTreeMap<String, TokenCatalogEntry>,
}

/// Delete rows whose height falls in `range`, then append and re-sort.
fn replace_in_range<T: Clone, K: Ord>(
    table: &mut Vec<T>,
    range: HeightRange,
    rows: &[T],
    height: impl Fn(&T) -> u64,
    key: impl Fn(&T) -> K,
) -> u64 {
    let before = table.len();
    table.retain(|r| !range.contains(height(r)));
    let deleted = (before - table.len()) as u64;
    table.extend(rows.iter().cloned());
    table.sort_by_key(|r| key(r));
    deleted
}

/// In-memory implementation of every store trait.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: MemoryCheckpointStore,
    leases: MemoryLeaseStore,
    errors: MemoryErrorLedger,
    blocks: Mutex<BTreeMap<u64, LedgerBlock>>,
    derived: Mutex<DerivedTables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all derived tables.
    pub async fn derived_snapshot(&self) -> DerivedTables {
        self.derived.lock().await.clone()
    }

    /// Append transfers without any dedup, as a broken writer would.
    pub async fn seed_token_transfers(&self, rows: &[TokenTransfer]) {
        self.derived.lock().await.token_transfers.extend(rows.iter().cloned());
    }

    pub async fn block_count(&self) -> usize {
        self.blocks.lock().await.len()
    }
}

// ─── CheckpointStore ─────────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, worker: &str) -> Result<Option<Checkpoint>, IndexerError> {
        self.checkpoints.load(worker).await
    }

    async fn set_checkpoint(&self, worker: &str, height: u64) -> Result<(), IndexerError> {
        self.checkpoints.set_checkpoint(worker, height).await
    }

    async fn advance_checkpoint(
        &self,
        worker: &str,
        height: u64,
        direction: Direction,
    ) -> Result<bool, IndexerError> {
        self.checkpoints.advance_checkpoint(worker, height, direction).await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        self.checkpoints.list().await
    }
}

// ─── LeaseStore ──────────────────────────────────────────────────────────────

#[async_trait]
impl LeaseStore for InMemoryStorage {
    async fn try_acquire(
        &self,
        worker: &str,
        range: HeightRange,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, IndexerError> {
        self.leases.try_acquire(worker, range, holder, ttl).await
    }

    async fn complete(
        &self,
        worker: &str,
        range_start: u64,
        holder: &str,
    ) -> Result<bool, IndexerError> {
        self.leases.complete(worker, range_start, holder).await
    }

    async fn release(
        &self,
        worker: &str,
        range_start: u64,
        holder: &str,
    ) -> Result<bool, IndexerError> {
        self.leases.release(worker, range_start, holder).await
    }

    async fn completed(&self, worker: &str) -> Result<Vec<Lease>, IndexerError> {
        self.leases.completed(worker).await
    }

    async fn active(&self, worker: &str) -> Result<Vec<Lease>, IndexerError> {
        self.leases.active(worker).await
    }

    async fn remove(&self, worker: &str, range_starts: &[u64]) -> Result<u64, IndexerError> {
        self.leases.remove(worker, range_starts).await
    }

    async fn remove_behind(
        &self,
        worker: &str,
        checkpoint: u64,
        direction: Direction,
    ) -> Result<u64, IndexerError> {
        self.leases.remove_behind(worker, checkpoint, direction).await
    }

    async fn delete_from(
        &self,
        worker: &str,
        height: u64,
        direction: Direction,
    ) -> Result<u64, IndexerError> {
        self.leases.delete_from(worker, height, direction).await
    }
}

// ─── ErrorLedger ─────────────────────────────────────────────────────────────

#[async_trait]
impl ErrorLedger for InMemoryStorage {
    async fn record_error(
        &self,
        worker: &str,
        range: HeightRange,
        message: &str,
    ) -> Result<(), IndexerError> {
        self.errors.record_error(worker, range, message).await
    }

    async fn list_errors(
        &self,
        worker: Option<&str>,
        limit: usize,
    ) -> Result<ErrorReport, IndexerError> {
        self.errors.list_errors(worker, limit).await
    }

    async fn record_skipped_range(
        &self,
        worker: &str,
        range: HeightRange,
        reason: &str,
    ) -> Result<(), IndexerError> {
        self.errors.record_skipped_range(worker, range, reason).await
    }

    async fn list_skipped_ranges(
        &self,
        worker: Option<&str>,
    ) -> Result<Vec<SkippedRange>, IndexerError> {
        self.errors.list_skipped_ranges(worker).await
    }

    async fn resolve_errors(&self, worker: &str) -> Result<ResolveReport, IndexerError> {
        self.errors.resolve_errors(worker).await
    }

    async fn resolve_skipped_within(
        &self,
        worker: &str,
        range: HeightRange,
    ) -> Result<u64, IndexerError> {
        self.errors.resolve_skipped_within(worker, range).await
    }
}

// ─── RawLedgerStore ──────────────────────────────────────────────────────────

#[async_trait]
impl RawLedgerStore for InMemoryStorage {
    async fn save_batch(
        &self,
        blocks: &[LedgerBlock],
        checkpoint: CheckpointUpdate,
    ) -> Result<bool, IndexerError> {
        // The block lock is held across the checkpoint write so readers never
        // see the checkpoint ahead of its blocks.
        let mut stored = self.blocks.lock().await;
        for block in blocks {
            stored.insert(block.height, block.clone());
        }
        let moved = self
            .checkpoints
            .advance_checkpoint(&checkpoint.worker, checkpoint.height, checkpoint.direction)
            .await?;
        debug!(blocks = blocks.len(), worker = %checkpoint.worker, height = checkpoint.height, moved, "saved raw batch");
        Ok(moved)
    }

    async fn blocks_in_range(&self, range: HeightRange) -> Result<Vec<LedgerBlock>, IndexerError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .blocks
            .lock()
            .await
            .range(range.start..range.end)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError> {
        Ok(self.blocks.lock().await.get(&height).cloned())
    }

    async fn lowest_height(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.blocks.lock().await.keys().next().copied())
    }

    async fn has_blocks(&self, range: HeightRange) -> Result<bool, IndexerError> {
        if range.is_empty() {
            return Ok(false);
        }
        Ok(self.blocks.lock().await.range(range.start..range.end).next().is_some())
    }
}

// ─── DerivedStore ────────────────────────────────────────────────────────────

#[async_trait]
impl DerivedStore for InMemoryStorage {
    async fn replace_token_transfers(
        &self,
        range: HeightRange,
        rows: &[TokenTransfer],
    ) -> Result<u64, IndexerError> {
        let mut d = self.derived.lock().await;
        Ok(replace_in_range(
            &mut d.token_transfers,
            range,
            rows,
            |r| r.block_height,
            |r| (r.block_height, r.tx_id.clone(), r.event_index),
        ))
    }

    async fn token_transfers_in_range(
        &self,
        range: HeightRange,
    ) -> Result<Vec<TokenTransfer>, IndexerError> {
        let d = self.derived.lock().await;
        Ok(d.token_transfers
            .iter()
            .filter(|t| range.contains(t.block_height))
            .cloned()
            .collect())
    }

    async fn upsert_evm_transactions(&self, rows: &[EvmTransaction]) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        for row in rows {
            d.evm_transactions.insert(row.hash.clone(), row.clone());
        }
        Ok(())
    }

    async fn upsert_accounts(&self, sightings: &[AccountSighting]) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        for s in sightings {
            d.accounts
                .entry(s.address.clone())
                .and_modify(|a| a.merge(s))
                .or_insert_with(|| Account::from(s));
        }
        Ok(())
    }

    async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError> {
        Ok(self.derived.lock().await.accounts.get(address).cloned())
    }

    async fn replace_ft_deltas(
        &self,
        range: HeightRange,
        rows: &[FtHoldingDelta],
    ) -> Result<u64, IndexerError> {
        let mut d = self.derived.lock().await;
        Ok(replace_in_range(
            &mut d.ft_holding_deltas,
            range,
            rows,
            |r| r.block_height,
            |r| (r.block_height, r.address.clone(), r.contract.clone()),
        ))
    }

    async fn ft_balance(&self, address: &str, contract: &str) -> Result<Decimal, IndexerError> {
        let d = self.derived.lock().await;
        Ok(d.ft_holding_deltas
            .iter()
            .filter(|r| r.address == address && r.contract == contract)
            .map(|r| r.delta)
            .sum())
    }

    async fn upsert_nft_ownership(&self, rows: &[NftOwnership]) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        for row in rows {
            let key = (row.contract.clone(), row.nft_id.clone());
            match d.nft_ownership.get(&key) {
                Some(existing) if existing.last_height > row.last_height => {}
                _ => {
                    d.nft_ownership.insert(key, row.clone());
                }
            }
        }
        Ok(())
    }

    async fn nft_owner(
        &self,
        contract: &str,
        nft_id: &str,
    ) -> Result<Option<NftOwnership>, IndexerError> {
        let d = self.derived.lock().await;
        Ok(d.nft_ownership
            .get(&(contract.to_string(), nft_id.to_string()))
            .cloned())
    }

    async fn replace_tx_contract_tags(
        &self,
        range: HeightRange,
        rows: &[TxContractTag],
    ) -> Result<u64, IndexerError> {
        let mut d = self.derived.lock().await;
        Ok(replace_in_range(
            &mut d.tx_contract_tags,
            range,
            rows,
            |r| r.block_height,
            |r| (r.block_height, r.tx_id.clone(), r.contract.clone()),
        ))
    }

    async fn upsert_block_metrics(&self, rows: &[BlockMetrics]) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        for row in rows {
            d.block_metrics.insert(row.height, row.clone());
        }
        Ok(())
    }

    async fn block_metrics_in_range(
        &self,
        range: HeightRange,
    ) -> Result<Vec<BlockMetrics>, IndexerError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let d = self.derived.lock().await;
        Ok(d.block_metrics
            .range(range.start..range.end)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn block_metrics_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BlockMetrics>, IndexerError> {
        let d = self.derived.lock().await;
        Ok(d.block_metrics
            .values()
            .filter(|m| m.timestamp >= from && m.timestamp < to)
            .cloned()
            .collect())
    }

    async fn upsert_daily_stats(&self, rows: &[DailyStats]) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        for row in rows {
            match d.daily_stats.get(&row.day) {
                Some(held) if held.blocks > row.blocks => {}
                _ => {
                    d.daily_stats.insert(row.day, row.clone());
                }
            }
        }
        Ok(())
    }

    async fn daily_stats(&self, day: NaiveDate) -> Result<Option<DailyStats>, IndexerError> {
        Ok(self.derived.lock().await.daily_stats.get(&day).cloned())
    }

    async fn replace_staking_events(
        &self,
        range: HeightRange,
        rows: &[StakingEvent],
    ) -> Result<u64, IndexerError> {
        let mut d = self.derived.lock().await;
        Ok(replace_in_range(
            &mut d.staking_events,
            range,
            rows,
            |r| r.block_height,
            |r| (r.block_height, r.tx_id.clone(), r.event_index),
        ))
    }

    async fn upsert_account_keys(&self, rows: &[AccountKey]) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        for row in rows {
            let key = (row.address.clone(), row.key_index);
            match d.account_keys.get(&key) {
                Some(existing) if existing.last_height > row.last_height => {}
                existing => {
                    let mut next = row.clone();
                    if next.public_key.is_none() {
                        next.public_key = existing.and_then(|k| k.public_key.clone());
                    }
                    d.account_keys.insert(key, next);
                }
            }
        }
        Ok(())
    }

    async fn account_keys(&self, address: &str) -> Result<Vec<AccountKey>, IndexerError> {
        let d = self.derived.lock().await;
        Ok(d.account_keys
            .values()
            .filter(|k| k.address == address)
            .cloned()
            .collect())
    }

    async fn upsert_token_catalog(&self, rows: &[TokenSighting]) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        for s in rows {
            d.token_catalog
                .entry(s.contract.clone())
                .and_modify(|t| {
                    t.first_seen_height = t.first_seen_height.min(s.height);
                    t.last_seen_height = t.last_seen_height.max(s.height);
                })
                .or_insert_with(|| TokenCatalogEntry {
                    contract: s.contract.clone(),
                    kind: s.kind,
                    first_seen_height: s.height,
                    last_seen_height: s.height,
                    metadata: None,
                });
        }
        Ok(())
    }

    async fn token(&self, contract: &str) -> Result<Option<TokenCatalogEntry>, IndexerError> {
        Ok(self.derived.lock().await.token_catalog.get(contract).cloned())
    }

    async fn tokens_missing_metadata(&self, limit: usize) -> Result<Vec<String>, IndexerError> {
        let d = self.derived.lock().await;
        let mut missing: Vec<&TokenCatalogEntry> =
            d.token_catalog.values().filter(|t| t.metadata.is_none()).collect();
        missing.sort_by_key(|t| (t.first_seen_height, t.contract.clone()));
        Ok(missing.into_iter().take(limit).map(|t| t.contract.clone()).collect())
    }

    async fn set_token_metadata(
        &self,
        contract: &str,
        metadata: &TokenMetadata,
    ) -> Result<(), IndexerError> {
        let mut d = self.derived.lock().await;
        match d.token_catalog.get_mut(contract) {
            Some(entry) => {
                entry.metadata = Some(metadata.clone());
                Ok(())
            }
            None => Err(IndexerError::Storage(format!("unknown token contract {contract}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ledgermirror_core::derived::TokenKind;

    fn block(height: u64) -> LedgerBlock {
        LedgerBlock {
            height,
            id: format!("b{height}"),
            parent_id: format!("b{}", height.saturating_sub(1)),
            timestamp: Utc.timestamp_opt(1_700_000_000 + height as i64, 0).unwrap(),
            transactions: Vec::new(),
            events: Vec::new(),
        }
    }

    fn transfer(height: u64, tx: &str, idx: u32) -> TokenTransfer {
        TokenTransfer {
            block_height: height,
            tx_id: tx.into(),
            event_index: idx,
            contract: "0x01.FlowToken".into(),
            from: Some("0xa".into()),
            to: Some("0xb".into()),
            amount: Decimal::new(15, 1),
            token_id: None,
            is_nft: false,
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn save_batch_writes_blocks_and_checkpoint() {
        let store = InMemoryStorage::new();
        let update = CheckpointUpdate {
            worker: "main_ingester".into(),
            height: 13,
            direction: Direction::Forward,
        };
        let moved = store.save_batch(&[block(10), block(11), block(12)], update.clone()).await.unwrap();
        assert!(moved);
        assert!(!store.save_batch(&[block(10)], update).await.unwrap());
        assert_eq!(store.get_height("main_ingester").await.unwrap(), 13);
        assert_eq!(store.block_count().await, 3);
        assert_eq!(store.lowest_height().await.unwrap(), Some(10));
        assert!(store.has_blocks(HeightRange::new(12, 20)).await.unwrap());
        assert!(!store.has_blocks(HeightRange::new(13, 20)).await.unwrap());
        let got = store.blocks_in_range(HeightRange::new(11, 13)).await.unwrap();
        assert_eq!(got.iter().map(|b| b.height).collect::<Vec<_>>(), vec![11, 12]);
    }

    #[tokio::test]
    async fn replace_removes_seeded_duplicates() {
        let store = InMemoryStorage::new();
        store
            .seed_token_transfers(&[transfer(5, "t1", 0), transfer(5, "t1", 0), transfer(20, "t9", 1)])
            .await;
        let deleted = store
            .replace_token_transfers(HeightRange::new(0, 10), &[transfer(5, "t1", 0)])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        let rows = store.token_transfers_in_range(HeightRange::new(0, 100)).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn nft_upsert_ignores_stale_rows() {
        let store = InMemoryStorage::new();
        let owned = |owner: &str, h: u64| NftOwnership {
            contract: "0x02.Moments".into(),
            nft_id: "7".into(),
            owner: owner.into(),
            last_height: h,
        };
        store.upsert_nft_ownership(&[owned("alice", 100)]).await.unwrap();
        store.upsert_nft_ownership(&[owned("bob", 50)]).await.unwrap();
        assert_eq!(store.nft_owner("0x02.Moments", "7").await.unwrap().unwrap().owner, "alice");
        store.upsert_nft_ownership(&[owned("carol", 120)]).await.unwrap();
        assert_eq!(store.nft_owner("0x02.Moments", "7").await.unwrap().unwrap().owner, "carol");
    }

    #[tokio::test]
    async fn ft_balance_sums_deltas() {
        let store = InMemoryStorage::new();
        let delta = |h: u64, v: i64| FtHoldingDelta {
            block_height: h,
            address: "0xa".into(),
            contract: "0x01.FlowToken".into(),
            delta: Decimal::new(v, 0),
        };
        store
            .replace_ft_deltas(HeightRange::new(0, 10), &[delta(1, 10), delta(5, -3)])
            .await
            .unwrap();
        assert_eq!(store.ft_balance("0xa", "0x01.FlowToken").await.unwrap(), Decimal::new(7, 0));
        // re-running the range does not double count
        store
            .replace_ft_deltas(HeightRange::new(0, 10), &[delta(1, 10), delta(5, -3)])
            .await
            .unwrap();
        assert_eq!(store.ft_balance("0xa", "0x01.FlowToken").await.unwrap(), Decimal::new(7, 0));
    }

    #[tokio::test]
    async fn token_catalog_tracks_first_and_last_seen() {
        let store = InMemoryStorage::new();
        let seen = |h: u64| TokenSighting {
            contract: "0x01.FlowToken".into(),
            kind: TokenKind::Fungible,
            height: h,
        };
        store.upsert_token_catalog(&[seen(50), seen(10), seen(90)]).await.unwrap();
        let entry = store.token("0x01.FlowToken").await.unwrap().unwrap();
        assert_eq!((entry.first_seen_height, entry.last_seen_height), (10, 90));
        assert_eq!(store.tokens_missing_metadata(10).await.unwrap(), vec!["0x01.FlowToken"]);

        let meta = TokenMetadata { name: Some("Flow".into()), symbol: Some("FLOW".into()), decimals: Some(8) };
        store.set_token_metadata("0x01.FlowToken", &meta).await.unwrap();
        assert!(store.tokens_missing_metadata(10).await.unwrap().is_empty());
        assert!(store.set_token_metadata("0xdead.Nope", &meta).await.is_err());
    }
}
