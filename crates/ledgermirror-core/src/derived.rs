//! Derived tables written by derivation workers.
//!
//! Each table has a natural key and exactly one owning worker. Writes are
//! either upserts on that key or, for log-shaped tables, a delete of the
//! chunk's height range followed by an insert. Both make re-running a chunk
//! produce the same final rows.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::HeightRange;

// ─── Rows ────────────────────────────────────────────────────────────────────

/// One paired token movement. Key: `(block_height, tx_id, event_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub block_height: u64,
    pub tx_id: String,
    pub event_index: u32,
    /// `<address>.<ContractName>`
    pub contract: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Decimal,
    pub token_id: Option<String>,
    pub is_nft: bool,
    pub timestamp: DateTime<Utc>,
}

impl TokenTransfer {
    pub fn key(&self) -> (u64, &str, u32) {
        (self.block_height, &self.tx_id, self.event_index)
    }
}

/// Key: `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmTransaction {
    pub hash: String,
    pub block_height: u64,
    pub tx_id: String,
    pub event_index: u32,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: String,
    pub gas_used: u64,
    pub status_code: i64,
    pub timestamp: DateTime<Utc>,
}

/// An account observed at a height. Merged into `accounts` by address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSighting {
    pub address: String,
    pub height: u64,
    /// Set when the sighting is the account's creation event.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub first_seen_height: u64,
    pub last_seen_height: u64,
    pub created_height: Option<u64>,
}

impl Account {
    /// Fold a sighting into the row with LEAST/GREATEST semantics.
    pub fn merge(&mut self, s: &AccountSighting) {
        self.first_seen_height = self.first_seen_height.min(s.height);
        self.last_seen_height = self.last_seen_height.max(s.height);
        if s.created {
            self.created_height = Some(self.created_height.map_or(s.height, |h| h.min(s.height)));
        }
    }
}

impl From<&AccountSighting> for Account {
    fn from(s: &AccountSighting) -> Self {
        Self {
            address: s.address.clone(),
            first_seen_height: s.height,
            last_seen_height: s.height,
            created_height: s.created.then_some(s.height),
        }
    }
}

/// Net fungible balance change in one block. Key: `(block_height, address, contract)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtHoldingDelta {
    pub block_height: u64,
    pub address: String,
    pub contract: String,
    pub delta: Decimal,
}

/// Current NFT owner. Key: `(contract, nft_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftOwnership {
    pub contract: String,
    pub nft_id: String,
    pub owner: String,
    pub last_height: u64,
}

/// Contract imported by a transaction script. Key: `(tx_id, contract)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxContractTag {
    pub tx_id: String,
    pub block_height: u64,
    pub contract: String,
}

/// Per-block counters. Key: `height`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetrics {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub tx_count: u64,
    pub failed_tx_count: u64,
    pub event_count: u64,
    pub total_gas: u64,
}

/// Per-UTC-day rollup of block metrics. Key: `day`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    pub day: NaiveDate,
    pub blocks: u64,
    pub transactions: u64,
    pub failed_transactions: u64,
    pub events: u64,
    pub total_gas: u64,
    pub first_height: u64,
    pub last_height: u64,
}

/// Key: `(block_height, tx_id, event_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingEvent {
    pub block_height: u64,
    pub tx_id: String,
    pub event_index: u32,
    pub event_name: String,
    pub node_id: Option<String>,
    pub delegator_id: Option<String>,
    pub amount: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Key: `(address, key_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountKey {
    pub address: String,
    pub key_index: u32,
    pub public_key: Option<String>,
    pub revoked: bool,
    pub last_height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Fungible,
    NonFungible,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fungible => "fungible",
            Self::NonFungible => "non_fungible",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "non_fungible" {
            Self::NonFungible
        } else {
            Self::Fungible
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u32>,
}

/// A token contract seen in transfers at `height`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSighting {
    pub contract: String,
    pub kind: TokenKind,
    pub height: u64,
}

/// Key: `contract`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCatalogEntry {
    pub contract: String,
    pub kind: TokenKind,
    pub first_seen_height: u64,
    pub last_seen_height: u64,
    pub metadata: Option<TokenMetadata>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait DerivedStore: Send + Sync {
    /// Delete transfers in `range`, then insert `rows`. Returns rows deleted.
    async fn replace_token_transfers(
        &self,
        range: HeightRange,
        rows: &[TokenTransfer],
    ) -> Result<u64, IndexerError>;

    async fn token_transfers_in_range(
        &self,
        range: HeightRange,
    ) -> Result<Vec<TokenTransfer>, IndexerError>;

    async fn upsert_evm_transactions(&self, rows: &[EvmTransaction]) -> Result<(), IndexerError>;

    async fn upsert_accounts(&self, sightings: &[AccountSighting]) -> Result<(), IndexerError>;

    async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError>;

    async fn replace_ft_deltas(
        &self,
        range: HeightRange,
        rows: &[FtHoldingDelta],
    ) -> Result<u64, IndexerError>;

    /// Sum of all deltas for the pair.
    async fn ft_balance(&self, address: &str, contract: &str) -> Result<Decimal, IndexerError>;

    /// Upsert owners, ignoring rows older than the stored `last_height`.
    async fn upsert_nft_ownership(&self, rows: &[NftOwnership]) -> Result<(), IndexerError>;

    async fn nft_owner(
        &self,
        contract: &str,
        nft_id: &str,
    ) -> Result<Option<NftOwnership>, IndexerError>;

    async fn replace_tx_contract_tags(
        &self,
        range: HeightRange,
        rows: &[TxContractTag],
    ) -> Result<u64, IndexerError>;

    async fn upsert_block_metrics(&self, rows: &[BlockMetrics]) -> Result<(), IndexerError>;

    async fn block_metrics_in_range(
        &self,
        range: HeightRange,
    ) -> Result<Vec<BlockMetrics>, IndexerError>;

    /// Metrics with `from <= timestamp < to`, ascending by height.
    async fn block_metrics_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BlockMetrics>, IndexerError>;

    /// A row covering fewer blocks than the stored one for its day is ignored.
    async fn upsert_daily_stats(&self, rows: &[DailyStats]) -> Result<(), IndexerError>;

    async fn daily_stats(&self, day: NaiveDate) -> Result<Option<DailyStats>, IndexerError>;

    async fn replace_staking_events(
        &self,
        range: HeightRange,
        rows: &[StakingEvent],
    ) -> Result<u64, IndexerError>;

    /// Upsert keys, ignoring rows older than the stored `last_height`.
    async fn upsert_account_keys(&self, rows: &[AccountKey]) -> Result<(), IndexerError>;

    async fn account_keys(&self, address: &str) -> Result<Vec<AccountKey>, IndexerError>;

    /// Merge sightings into the catalog without touching metadata.
    async fn upsert_token_catalog(&self, rows: &[TokenSighting]) -> Result<(), IndexerError>;

    async fn token(&self, contract: &str) -> Result<Option<TokenCatalogEntry>, IndexerError>;

    /// Contracts with no metadata yet, oldest first.
    async fn tokens_missing_metadata(&self, limit: usize) -> Result<Vec<String>, IndexerError>;

    async fn set_token_metadata(
        &self,
        contract: &str,
        metadata: &TokenMetadata,
    ) -> Result<(), IndexerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_merge_uses_least_and_greatest() {
        let mut acct = Account::from(&AccountSighting {
            address: "0x01".into(),
            height: 500,
            created: false,
        });
        acct.merge(&AccountSighting { address: "0x01".into(), height: 100, created: true });
        acct.merge(&AccountSighting { address: "0x01".into(), height: 900, created: false });
        assert_eq!(acct.first_seen_height, 100);
        assert_eq!(acct.last_seen_height, 900);
        assert_eq!(acct.created_height, Some(100));

        // re-applying is a no-op
        let before = acct.clone();
        acct.merge(&AccountSighting { address: "0x01".into(), height: 100, created: true });
        assert_eq!(acct, before);
    }

    #[test]
    fn token_kind_roundtrip() {
        assert_eq!(TokenKind::parse(TokenKind::NonFungible.as_str()), TokenKind::NonFungible);
        assert_eq!(TokenKind::parse("anything"), TokenKind::Fungible);
    }
}
