//! Token metadata enrichment through read-only script execution.
//!
//! The oracle is slow and unreliable, so it runs outside the worker
//! scheduler. Every call is bounded by a timeout and scripts are tried in
//! order until one returns a usable answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledgermirror_core::config::OracleConfig;
use ledgermirror_core::derived::{DerivedStore, TokenMetadata};
use ledgermirror_core::error::IndexerError;

use crate::payload::decode_typed;

/// Executes read-only scripts against the ledger.
#[async_trait]
pub trait MetadataOracle: Send + Sync {
    async fn execute_read_only(&self, script: &str, args: &[Value]) -> Result<Value, IndexerError>;
}

// ─── HttpScriptOracle ────────────────────────────────────────────────────────

/// `POST {base}/scripts` with `{"script": .., "arguments": [..]}`.
pub struct HttpScriptOracle {
    url: String,
    http: reqwest::Client,
}

impl HttpScriptOracle {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::config(format!("http client: {e}")))?;
        Ok(Self {
            url: format!("{}/scripts", base.into().trim_end_matches('/')),
            http,
        })
    }
}

#[async_trait]
impl MetadataOracle for HttpScriptOracle {
    async fn execute_read_only(&self, script: &str, args: &[Value]) -> Result<Value, IndexerError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&json!({ "script": script, "arguments": args }))
            .send()
            .await
            .map_err(|e| IndexerError::Rpc(format!("execute script: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexerError::Rpc(format!("execute script: HTTP {}: {body}", status.as_u16())));
        }
        resp.json()
            .await
            .map_err(|e| IndexerError::Rpc(format!("execute script decode: {e}")))
    }
}

// ─── FallbackOracle ──────────────────────────────────────────────────────────

/// Split `<address>.<Name>` into script arguments.
fn contract_args(contract: &str) -> Result<Vec<Value>, IndexerError> {
    let (address, name) = contract
        .split_once('.')
        .filter(|(a, n)| !a.is_empty() && !n.is_empty())
        .ok_or_else(|| IndexerError::permanent(format!("malformed contract id '{contract}'")))?;
    Ok(vec![json!(format!("0x{address}")), json!(name)])
}

/// Pull name, symbol and decimals out of a script result. `None` when the
/// result carries none of them.
pub fn metadata_from(result: &Value) -> Option<TokenMetadata> {
    let decoded = decode_typed(result);
    let obj = decoded.as_object()?;
    let text = |key: &str| {
        obj.get(key)
            .map(decode_typed)
            .and_then(|v| v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string))
    };
    let decimals = obj.get("decimals").map(decode_typed).and_then(|v| match v {
        Value::Number(n) => n.as_u64().and_then(|d| u32::try_from(d).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    let meta = TokenMetadata {
        name: text("name"),
        symbol: text("symbol"),
        decimals,
    };
    (meta.name.is_some() || meta.symbol.is_some() || meta.decimals.is_some()).then_some(meta)
}

/// Tries each configured script in order under a per-call timeout.
pub struct FallbackOracle {
    oracle: Arc<dyn MetadataOracle>,
    scripts: Vec<String>,
    timeout: Duration,
}

impl FallbackOracle {
    pub fn new(oracle: Arc<dyn MetadataOracle>, scripts: Vec<String>, timeout: Duration) -> Self {
        Self { oracle, scripts, timeout }
    }

    pub fn from_config(oracle: Arc<dyn MetadataOracle>, config: &OracleConfig) -> Self {
        Self::new(oracle, config.scripts.clone(), Duration::from_secs(config.timeout_secs))
    }

    /// `Ok(None)` if some script answered without metadata, `Err` if every
    /// script failed.
    pub async fn token_metadata(&self, contract: &str) -> Result<Option<TokenMetadata>, IndexerError> {
        let args = contract_args(contract)?;
        let mut answered = false;
        let mut last_error = None;

        for (i, script) in self.scripts.iter().enumerate() {
            let call = self.oracle.execute_read_only(script, &args);
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(result)) => {
                    answered = true;
                    if let Some(meta) = metadata_from(&result) {
                        debug!(contract, script = i, "token metadata resolved");
                        return Ok(Some(meta));
                    }
                }
                Ok(Err(e)) => {
                    debug!(contract, script = i, error = %e, "metadata script failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(contract, script = i, "metadata script timed out");
                    last_error = Some(IndexerError::Timeout {
                        operation: format!("metadata script {i} for {contract}"),
                        after_ms: self.timeout.as_millis() as u64,
                    });
                }
            }
        }

        match (answered, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(None),
        }
    }
}

// ─── MetadataEnricher ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub checked: usize,
    pub filled: usize,
    /// Answered, but no metadata exists. Stored empty so it is not retried.
    pub empty: usize,
    pub failed: usize,
}

/// Fills catalog rows that have no metadata yet.
pub struct MetadataEnricher {
    derived: Arc<dyn DerivedStore>,
    oracle: FallbackOracle,
    batch_limit: usize,
    interval: Duration,
}

impl MetadataEnricher {
    pub fn new(derived: Arc<dyn DerivedStore>, oracle: FallbackOracle, config: &OracleConfig) -> Self {
        Self {
            derived,
            oracle,
            batch_limit: config.batch_limit.max(1),
            interval: Duration::from_secs(config.interval_secs.max(1)),
        }
    }

    pub async fn run_once(&self) -> Result<EnrichReport, IndexerError> {
        let pending = self.derived.tokens_missing_metadata(self.batch_limit).await?;
        let mut report = EnrichReport {
            checked: pending.len(),
            ..EnrichReport::default()
        };
        for contract in pending {
            match self.oracle.token_metadata(&contract).await {
                Ok(Some(meta)) => {
                    self.derived.set_token_metadata(&contract, &meta).await?;
                    report.filled += 1;
                }
                Ok(None) => {
                    let none = TokenMetadata { name: None, symbol: None, decimals: None };
                    self.derived.set_token_metadata(&contract, &none).await?;
                    report.empty += 1;
                }
                Err(e) => {
                    warn!(contract = %contract, error = %e, "metadata lookup failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), IndexerError> {
        info!(batch_limit = self.batch_limit, interval_secs = self.interval.as_secs(), "metadata enricher started");
        while !cancel.is_cancelled() {
            match self.run_once().await {
                Ok(report) if report.checked > 0 => info!(
                    checked = report.checked,
                    filled = report.filled,
                    empty = report.empty,
                    failed = report.failed,
                    "metadata pass finished"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "metadata pass failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("metadata enricher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgermirror_core::derived::{TokenKind, TokenSighting};
    use ledgermirror_storage::InMemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Script "slow" hangs, "broken" errors, "empty" returns null, anything
    /// else returns metadata.
    #[derive(Default)]
    struct ScriptedOracle {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataOracle for ScriptedOracle {
        async fn execute_read_only(&self, script: &str, args: &[Value]) -> Result<Value, IndexerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match script {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
                "broken" => Err(IndexerError::Rpc("script panicked".into())),
                "empty" => Ok(Value::Null),
                _ => Ok(json!({
                    "type": "Struct",
                    "value": {"fields": [
                        {"name": "name", "value": {"type": "String", "value": args[1].as_str().unwrap_or("")}},
                        {"name": "symbol", "value": {"type": "String", "value": "TOK"}},
                        {"name": "decimals", "value": {"type": "UInt8", "value": "8"}}
                    ]}
                })),
            }
        }
    }

    fn fallback(scripts: &[&str]) -> (FallbackOracle, Arc<ScriptedOracle>) {
        let oracle = Arc::new(ScriptedOracle::default());
        let fb = FallbackOracle::new(
            oracle.clone(),
            scripts.iter().map(|s| s.to_string()).collect(),
            Duration::from_millis(50),
        );
        (fb, oracle)
    }

    #[tokio::test]
    async fn falls_through_slow_and_broken_scripts() {
        let (fb, oracle) = fallback(&["slow", "broken", "good"]);
        let meta = fb.token_metadata("0ae53cb6e3f42a79.FlowToken").await.unwrap().unwrap();
        assert_eq!(meta.name.as_deref(), Some("FlowToken"));
        assert_eq!(meta.symbol.as_deref(), Some("TOK"));
        assert_eq!(meta.decimals, Some(8));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn all_failures_is_an_error_but_empty_answer_is_not() {
        let (fb, _) = fallback(&["broken"]);
        assert!(fb.token_metadata("01.Coin").await.is_err());

        let (fb, _) = fallback(&["broken", "empty"]);
        assert_eq!(fb.token_metadata("01.Coin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_contract_is_rejected() {
        let (fb, oracle) = fallback(&["good"]);
        assert!(fb.token_metadata("nodot").await.is_err());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enricher_fills_catalog() {
        let store = Arc::new(InMemoryStorage::new());
        store
            .upsert_token_catalog(&[
                TokenSighting { contract: "01.Coin".into(), kind: TokenKind::Fungible, height: 5 },
                TokenSighting { contract: "02.Kitty".into(), kind: TokenKind::NonFungible, height: 6 },
            ])
            .await
            .unwrap();

        let (fb, _) = fallback(&["good"]);
        let config = OracleConfig { enabled: true, ..OracleConfig::default() };
        let enricher = MetadataEnricher::new(store.clone(), fb, &config);

        let report = enricher.run_once().await.unwrap();
        assert_eq!(report, EnrichReport { checked: 2, filled: 2, empty: 0, failed: 0 });
        assert!(store.tokens_missing_metadata(10).await.unwrap().is_empty());
        let coin = store.token("01.Coin").await.unwrap().unwrap();
        assert_eq!(coin.metadata.unwrap().name.as_deref(), Some("Coin"));

        assert_eq!(enricher.run_once().await.unwrap().checked, 0);
    }
}
