//! Contracts imported by each transaction's script.
//!
//! Scripts repeat heavily (wallet templates), so parsed imports are cached
//! by the script's SHA-256.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use ledgermirror_core::derived::{DerivedStore, TxContractTag};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::RawLedgerStore;
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

pub const TX_CONTRACTS_WORKER: &str = "tx_contracts_worker";

/// Cached scripts before the cache is cleared.
const IMPORT_CACHE_LIMIT: usize = 10_000;

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_import_line(line: &str) -> Vec<String> {
    let Some(rest) = line.trim_start().strip_prefix("import") else {
        return Vec::new();
    };
    if !rest.starts_with(char::is_whitespace) {
        return Vec::new();
    }

    let (names, address) = match rest.split_once(" from ") {
        Some((names, source)) => {
            let source = source.split_whitespace().next().unwrap_or_default();
            match source.strip_prefix("0x") {
                Some(hex) if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
                    (names, Some(hex.to_ascii_lowercase()))
                }
                _ => return Vec::new(),
            }
        }
        None => (rest, None),
    };

    names
        .split(',')
        .map(str::trim)
        .filter(|n| is_identifier(n))
        .map(|name| match &address {
            Some(addr) => format!("A.{addr}.{name}"),
            None => name.to_string(),
        })
        .collect()
}

/// Contract identifiers imported by `script`, e.g. `A.1654653399040a61.FlowToken`.
///
/// Imports without an address (resolved by the node's alias table) keep the
/// bare contract name. String imports are ignored.
pub fn parse_imports(script: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    script
        .lines()
        .flat_map(parse_import_line)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

pub fn script_hash(script: &str) -> String {
    hex::encode(Sha256::digest(script.as_bytes()))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TxContractsWorker {
    raw: Arc<dyn RawLedgerStore>,
    derived: Arc<dyn DerivedStore>,
    imports: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

impl TxContractsWorker {
    pub fn new(raw: Arc<dyn RawLedgerStore>, derived: Arc<dyn DerivedStore>) -> Self {
        Self {
            raw,
            derived,
            imports: Mutex::new(HashMap::new()),
        }
    }

    fn imports_of(&self, script: &str) -> Arc<Vec<String>> {
        let hash = script_hash(script);
        if let Some(hit) = lock(&self.imports).get(&hash) {
            return Arc::clone(hit);
        }
        let parsed = Arc::new(parse_imports(script));
        let mut cache = lock(&self.imports);
        if cache.len() >= IMPORT_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(hash, Arc::clone(&parsed));
        parsed
    }

    pub fn cached_scripts(&self) -> usize {
        lock(&self.imports).len()
    }
}

#[async_trait]
impl Processor for TxContractsWorker {
    fn name(&self) -> &str {
        TX_CONTRACTS_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let range = HeightRange::new(from, to);
        let txs = self.raw.transactions_in_range(range).await?;
        let mut rows = Vec::new();
        for tx in txs.iter().filter(|tx| !tx.script.trim().is_empty()) {
            for contract in self.imports_of(&tx.script).iter() {
                rows.push(TxContractTag {
                    tx_id: tx.id.clone(),
                    block_height: tx.block_height,
                    contract: contract.clone(),
                });
            }
        }
        let deleted = self.derived.replace_tx_contract_tags(range, &rows).await?;
        debug!(worker = TX_CONTRACTS_WORKER, from, to, rows = rows.len(), deleted, "contract tags written");
        Ok(())
    }
}
