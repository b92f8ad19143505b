//! Raw ledger data: blocks, transactions and events as pulled from the chain.
//!
//! Raw rows are append-only and ordered by height. Only the raw ingesters
//! write them; derivation workers read them through [`RawLedgerStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{Direction, HeightRange};

/// A block with everything that happened in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub height: u64,
    pub id: String,
    pub parent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub transactions: Vec<LedgerTransaction>,
    #[serde(default)]
    pub events: Vec<LedgerEvent>,
}

impl LedgerBlock {
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            height: self.height,
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            timestamp: self.timestamp,
            tx_count: self.transactions.len() as u32,
            event_count: self.events.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub block_height: u64,
    pub tx_index: u32,
    pub proposer: String,
    #[serde(default)]
    pub proposer_key_index: u32,
    pub payer: String,
    #[serde(default)]
    pub authorizers: Vec<String>,
    #[serde(default)]
    pub script: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub gas_used: u64,
}

impl LedgerTransaction {
    pub fn is_failed(&self) -> bool {
        self.error_message.as_deref().map(|m| !m.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub block_height: u64,
    pub tx_id: String,
    pub tx_index: u32,
    pub event_index: u32,
    /// Fully qualified type, e.g. `A.1654653399040a61.FlowToken.TokensDeposited`.
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl LedgerEvent {
    /// Contract address embedded in an `A.<address>.<Contract>.<Event>` type.
    pub fn contract_address(&self) -> Option<&str> {
        let mut parts = self.event_type.split('.');
        match (parts.next(), parts.next()) {
            (Some("A"), Some(addr)) if !addr.is_empty() => Some(addr),
            _ => None,
        }
    }

    /// Contract name embedded in the event type.
    pub fn contract_name(&self) -> Option<&str> {
        let parts: Vec<&str> = self.event_type.split('.').collect();
        if parts.len() >= 4 && parts[0] == "A" {
            Some(parts[2])
        } else {
            None
        }
    }

    /// Last segment of the event type.
    pub fn event_name(&self) -> &str {
        self.event_type.rsplit('.').next().unwrap_or(&self.event_type)
    }

    /// Payload as a JSON object, or a permanent error for any other shape.
    pub fn fields(&self) -> Result<&serde_json::Map<String, serde_json::Value>, IndexerError> {
        self.payload.as_object().ok_or_else(|| {
            IndexerError::permanent(format!(
                "event {}#{} ({}) payload is not an object",
                self.tx_id, self.event_index, self.event_type
            ))
        })
    }
}

/// Lightweight block header used by the fan-out hub and status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u64,
    pub id: String,
    pub parent_id: String,
    pub timestamp: DateTime<Utc>,
    pub tx_count: u32,
    pub event_count: u32,
}

/// Checkpoint move committed together with a raw batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointUpdate {
    pub worker: String,
    pub height: u64,
    pub direction: Direction,
}

#[async_trait]
pub trait RawLedgerStore: Send + Sync {
    /// Persist `blocks` and advance the ingester's checkpoint in one atomic step.
    ///
    /// Re-saving an existing height overwrites it. Returns whether the
    /// checkpoint moved.
    async fn save_batch(
        &self,
        blocks: &[LedgerBlock],
        checkpoint: CheckpointUpdate,
    ) -> Result<bool, IndexerError>;

    /// Blocks with height in `range`, ascending.
    async fn blocks_in_range(&self, range: HeightRange) -> Result<Vec<LedgerBlock>, IndexerError>;

    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError>;

    async fn lowest_height(&self) -> Result<Option<u64>, IndexerError>;

    /// Whether any block with height in `range` is stored.
    async fn has_blocks(&self, range: HeightRange) -> Result<bool, IndexerError>;

    /// Events in `range`, ordered by height then event index.
    async fn events_in_range(&self, range: HeightRange) -> Result<Vec<LedgerEvent>, IndexerError> {
        let blocks = self.blocks_in_range(range).await?;
        Ok(blocks.into_iter().flat_map(|b| b.events).collect())
    }

    async fn transactions_in_range(
        &self,
        range: HeightRange,
    ) -> Result<Vec<LedgerTransaction>, IndexerError> {
        let blocks = self.blocks_in_range(range).await?;
        Ok(blocks.into_iter().flat_map(|b| b.transactions).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: serde_json::Value) -> LedgerEvent {
        LedgerEvent {
            block_height: 1,
            tx_id: "tx".into(),
            tx_index: 0,
            event_index: 0,
            event_type: event_type.into(),
            payload,
        }
    }

    #[test]
    fn event_type_parts() {
        let e = event("A.1654653399040a61.FlowToken.TokensDeposited", json!({}));
        assert_eq!(e.contract_address(), Some("1654653399040a61"));
        assert_eq!(e.contract_name(), Some("FlowToken"));
        assert_eq!(e.event_name(), "TokensDeposited");

        let system = event("flow.AccountCreated", json!({}));
        assert_eq!(system.contract_address(), None);
        assert_eq!(system.event_name(), "AccountCreated");
    }

    #[test]
    fn non_object_payload_is_permanent() {
        let e = event("A.01.Token.Deposited", json!([1, 2]));
        let err = e.fields().unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn block_json_defaults() {
        let b: LedgerBlock = serde_json::from_value(json!({
            "height": 7,
            "id": "b7",
            "parent_id": "b6",
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(b.transactions.is_empty());
        assert_eq!(b.summary().tx_count, 0);
    }
}
