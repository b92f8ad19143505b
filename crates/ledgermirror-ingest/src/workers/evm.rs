//! EVM transactions surfaced through `EVM.TransactionExecuted` events.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use ledgermirror_core::derived::{DerivedStore, EvmTransaction};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::{LedgerEvent, RawLedgerStore};
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

use crate::payload::event_fields;

pub const EVM_WORKER: &str = "evm_worker";

pub fn is_evm_execution(event_type: &str) -> bool {
    event_type.contains("EVM.TransactionExecuted")
}

/// Lowercase hex without prefix, from a hex string or a byte array.
fn hex_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            let s = s.trim_start_matches("0x").trim_start_matches("\\x");
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
        _ => None,
    }
}

fn first_hex(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| fields.get(*k).and_then(hex_value))
}

fn first_number(fields: &Map<String, Value>, keys: &[&str]) -> Option<i128> {
    keys.iter().find_map(|k| match fields.get(*k)? {
        Value::Number(n) => n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// `Ok(None)` when the event carries no hash.
pub fn parse_execution(
    event: &LedgerEvent,
    timestamp: DateTime<Utc>,
) -> Result<Option<EvmTransaction>, IndexerError> {
    let fields = event_fields(event)?;
    let Some(hash) = first_hex(&fields, &["hash", "transactionHash", "txHash", "evmHash"]) else {
        return Ok(None);
    };
    let value = match fields.get("value") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_string(),
    };
    let gas_used = first_number(&fields, &["gasUsed", "gas_used", "gasConsumed", "gas_consumed"])
        .and_then(|g| u64::try_from(g).ok())
        .unwrap_or(0);
    let status_code = first_number(&fields, &["statusCode", "status_code", "errorCode", "error_code"])
        .and_then(|c| i64::try_from(c).ok())
        .unwrap_or(0);

    Ok(Some(EvmTransaction {
        hash,
        block_height: event.block_height,
        tx_id: event.tx_id.clone(),
        event_index: event.event_index,
        from: first_hex(&fields, &["from", "fromAddress", "sender"]),
        to: first_hex(&fields, &["to", "toAddress", "recipient"]),
        value,
        gas_used,
        status_code,
        timestamp,
    }))
}

pub struct EvmWorker {
    raw: Arc<dyn RawLedgerStore>,
    derived: Arc<dyn DerivedStore>,
}

impl EvmWorker {
    pub fn new(raw: Arc<dyn RawLedgerStore>, derived: Arc<dyn DerivedStore>) -> Self {
        Self { raw, derived }
    }
}

#[async_trait]
impl Processor for EvmWorker {
    fn name(&self) -> &str {
        EVM_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let blocks = self.raw.blocks_in_range(HeightRange::new(from, to)).await?;
        let mut rows = Vec::new();
        for block in &blocks {
            for event in block.events.iter().filter(|e| is_evm_execution(&e.event_type)) {
                match parse_execution(event, block.timestamp)? {
                    Some(tx) => rows.push(tx),
                    None => warn!(
                        worker = EVM_WORKER,
                        height = event.block_height,
                        tx_id = %event.tx_id,
                        event_index = event.event_index,
                        "EVM execution without hash, skipped"
                    ),
                }
            }
        }
        self.derived.upsert_evm_transactions(&rows).await?;
        debug!(worker = EVM_WORKER, from, to, rows = rows.len(), "evm transactions upserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ev(payload: Value) -> LedgerEvent {
        LedgerEvent {
            block_height: 5,
            tx_id: "t".into(),
            tx_index: 0,
            event_index: 3,
            event_type: "A.e467b9dd11fa00df.EVM.TransactionExecuted".into(),
            payload,
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn parses_string_fields() {
        let tx = parse_execution(
            &ev(json!({"hash": "0xABCD", "from": "0x01", "to": "0x02", "value": "1000", "gasUsed": 21000, "errorCode": "0"})),
            ts(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(tx.hash, "abcd");
        assert_eq!(tx.from.as_deref(), Some("01"));
        assert_eq!(tx.value, "1000");
        assert_eq!(tx.gas_used, 21_000);
        assert_eq!(tx.status_code, 0);
        assert_eq!(tx.event_index, 3);
    }

    #[test]
    fn byte_array_hash_is_hex_encoded() {
        let tx = parse_execution(&ev(json!({"hash": [171, 205, 1]})), ts()).unwrap().unwrap();
        assert_eq!(tx.hash, "abcd01");
        assert_eq!(tx.value, "0");
    }

    #[test]
    fn missing_hash_is_skipped() {
        assert!(parse_execution(&ev(json!({"from": "0x01"})), ts()).unwrap().is_none());
    }

    #[test]
    fn matches_execution_events_only() {
        assert!(is_evm_execution("A.e467b9dd11fa00df.EVM.TransactionExecuted"));
        assert!(!is_evm_execution("A.e467b9dd11fa00df.EVM.BlockExecuted"));
    }
}
