//! Account keys from key add/remove events, backfilled with the proposal
//! keys transactions were signed with.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use ledgermirror_core::derived::{AccountKey, DerivedStore};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::{LedgerBlock, LedgerEvent, RawLedgerStore};
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

use crate::payload::{event_fields, field_address, normalize_address};

pub const ACCOUNT_KEYS_WORKER: &str = "account_keys_worker";

const KEY_ADDED: &str = "flow.AccountKeyAdded";
const KEY_REMOVED: &str = "flow.AccountKeyRemoved";

fn key_index(fields: &Map<String, Value>, key: &str) -> Option<u32> {
    match fields.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|i| u32::try_from(i).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Hex public key from a hex string or a `{publicKey: [bytes]}` structure.
fn public_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            let s = s.trim_start_matches("0x");
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Array(items) => {
            let bytes = items
                .iter()
                .map(|i| match i {
                    Value::Number(n) => n.as_u64().and_then(|b| u8::try_from(b).ok()),
                    Value::String(s) => s.parse::<u8>().ok(),
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()?;
            (!bytes.is_empty()).then(|| hex::encode(bytes))
        }
        Value::Object(obj) => obj.get("publicKey").and_then(public_key),
        _ => None,
    }
}

fn key_event(event: &LedgerEvent) -> Result<Option<AccountKey>, IndexerError> {
    let removed = event.event_type == KEY_REMOVED;
    let fields = event_fields(event)?;
    let Some(address) = field_address(&fields, &["address"]) else {
        return Ok(None);
    };

    if removed {
        // legacy payloads carried the index in `publicKey`
        let Some(index) = key_index(&fields, "keyIndex").or_else(|| key_index(&fields, "publicKey")) else {
            return Ok(None);
        };
        return Ok(Some(AccountKey {
            address,
            key_index: index,
            public_key: None,
            revoked: true,
            last_height: event.block_height,
        }));
    }

    let key = fields
        .get("publicKey")
        .and_then(public_key)
        .or_else(|| fields.get("key").and_then(public_key));
    let (Some(index), Some(key)) = (key_index(&fields, "keyIndex"), key) else {
        return Ok(None);
    };
    Ok(Some(AccountKey {
        address,
        key_index: index,
        public_key: Some(key),
        revoked: false,
        last_height: event.block_height,
    }))
}

/// Latest state per `(address, key_index)` within `blocks`.
pub fn collect_keys(blocks: &[LedgerBlock]) -> Result<Vec<AccountKey>, IndexerError> {
    let mut keys: BTreeMap<(String, u32), AccountKey> = BTreeMap::new();
    for block in blocks {
        for event in block
            .events
            .iter()
            .filter(|e| e.event_type == KEY_ADDED || e.event_type == KEY_REMOVED)
        {
            if let Some(row) = key_event(event)? {
                let slot = keys.entry((row.address.clone(), row.key_index)).or_insert_with(|| row.clone());
                if row.public_key.is_none() {
                    let kept = slot.public_key.take();
                    *slot = AccountKey { public_key: kept, ..row };
                } else {
                    *slot = row;
                }
            }
        }
        for tx in &block.transactions {
            let Some(address) = normalize_address(&tx.proposer) else {
                continue;
            };
            keys.entry((address.clone(), tx.proposer_key_index))
                .and_modify(|k| k.last_height = k.last_height.max(block.height))
                .or_insert(AccountKey {
                    address,
                    key_index: tx.proposer_key_index,
                    public_key: None,
                    revoked: false,
                    last_height: block.height,
                });
        }
    }
    Ok(keys.into_values().collect())
}

pub struct AccountKeysWorker {
    raw: Arc<dyn RawLedgerStore>,
    derived: Arc<dyn DerivedStore>,
}

impl AccountKeysWorker {
    pub fn new(raw: Arc<dyn RawLedgerStore>, derived: Arc<dyn DerivedStore>) -> Self {
        Self { raw, derived }
    }
}

#[async_trait]
impl Processor for AccountKeysWorker {
    fn name(&self) -> &str {
        ACCOUNT_KEYS_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let blocks = self.raw.blocks_in_range(HeightRange::new(from, to)).await?;
        let rows = collect_keys(&blocks)?;
        self.derived.upsert_account_keys(&rows).await?;
        debug!(worker = ACCOUNT_KEYS_WORKER, from, to, keys = rows.len(), "account keys upserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testutil::{block, event, tx};
    use serde_json::json;

    #[test]
    fn added_then_removed_keeps_public_key() {
        let mut b1 = block(1);
        b1.events.push(event(1, "t1", 0, KEY_ADDED, json!({
            "address": "0x0A",
            "keyIndex": 1,
            "publicKey": {"publicKey": [1, 2, 255], "signatureAlgorithm": 1}
        })));
        let mut b2 = block(2);
        b2.events.push(event(2, "t2", 0, KEY_REMOVED, json!({"address": "0x0a", "keyIndex": "1"})));

        let keys = collect_keys(&[b1, b2]).unwrap();
        assert_eq!(keys.len(), 1);
        let k = &keys[0];
        assert_eq!(k.address, "0a");
        assert_eq!(k.public_key.as_deref(), Some("0102ff"));
        assert!(k.revoked);
        assert_eq!(k.last_height, 2);
    }

    #[test]
    fn proposer_keys_are_backfilled() {
        let mut b = block(5);
        let mut t = tx(5, "t", "0xBB", &[]);
        t.proposer_key_index = 3;
        b.transactions.push(t);

        let keys = collect_keys(&[b]).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!((keys[0].address.as_str(), keys[0].key_index), ("bb", 3));
        assert_eq!(keys[0].public_key, None);
        assert!(!keys[0].revoked);
    }
}
