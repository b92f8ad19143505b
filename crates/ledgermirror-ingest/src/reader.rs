//! Chain readers used by the raw ingesters.
//!
//! - [`ChainReader`]: latest height and block-by-height
//! - [`RetryingReader`]: retries transient failures under a [`RetryPolicy`]
//! - [`HttpChainReader`]: JSON-over-HTTP access node client (`reqwest`)
//! - [`MemoryChainReader`]: scripted chain for tests and local runs

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, warn};

use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::LedgerBlock;
use ledgermirror_core::policy::RetryPolicy;

/// Read access to the remote ledger.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Height of the newest sealed block.
    async fn latest_height(&self) -> Result<u64, IndexerError>;

    /// Block with its transactions and events.
    ///
    /// `Ok(None)` means the height has not been produced yet, which the
    /// forward ingester treats as a reason to wait.
    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError>;
}

#[async_trait]
impl<R: ChainReader + ?Sized> ChainReader for Arc<R> {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        (**self).latest_height().await
    }

    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError> {
        (**self).block(height).await
    }
}

// ─── RetryingReader ──────────────────────────────────────────────────────────

/// Wraps a reader and retries transient errors with exponential backoff.
pub struct RetryingReader<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: ChainReader> RetryingReader<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, IndexerError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    match self.policy.next_delay(attempt) {
                        Some(delay) => {
                            warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying chain read");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!(op, attempt, error = %e, "chain read retries exhausted");
                            return Err(e);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<R: ChainReader> ChainReader for RetryingReader<R> {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        self.with_retry("latest_height", || self.inner.latest_height()).await
    }

    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError> {
        self.with_retry("block", || self.inner.block(height)).await
    }
}

// ─── HttpChainReader ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HeightResponse {
    height: u64,
}

/// Reads from an access node exposing `GET /height` and `GET /blocks/{height}`.
pub struct HttpChainReader {
    base: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpChainReader {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::config(format!("http client: {e}")))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    fn transport_error(&self, op: &str, e: reqwest::Error) -> IndexerError {
        if e.is_timeout() {
            IndexerError::Timeout {
                operation: format!("{op} {}", self.base),
                after_ms: self.timeout.as_millis() as u64,
            }
        } else {
            IndexerError::Rpc(format!("{op}: {e}"))
        }
    }

    async fn get(&self, op: &str, url: &str) -> Result<Option<reqwest::Response>, IndexerError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(op, e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let msg = format!("{op}: HTTP {}: {body}", status.as_u16());
            // 5xx and throttling are worth retrying, other 4xx are not
            return Err(if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                IndexerError::Rpc(msg)
            } else {
                IndexerError::permanent(msg)
            });
        }
        Ok(Some(resp))
    }
}

#[async_trait]
impl ChainReader for HttpChainReader {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        let url = format!("{}/height", self.base);
        let resp = self
            .get("latest_height", &url)
            .await?
            .ok_or_else(|| IndexerError::Rpc(format!("{url} returned 404")))?;
        let body: HeightResponse = resp
            .json()
            .await
            .map_err(|e| IndexerError::Rpc(format!("latest_height decode: {e}")))?;
        Ok(body.height)
    }

    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError> {
        let url = format!("{}/blocks/{height}", self.base);
        let Some(resp) = self.get("block", &url).await? else {
            debug!(height, "block not produced yet");
            return Ok(None);
        };
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| self.transport_error("block", e))?;
        let block: LedgerBlock = serde_json::from_slice(&bytes)?;
        if block.height != height {
            return Err(IndexerError::permanent(format!(
                "asked for block {height}, node returned {}",
                block.height
            )));
        }
        Ok(Some(block))
    }
}

// ─── MemoryChainReader ───────────────────────────────────────────────────────

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ScriptedChain {
    blocks: BTreeMap<u64, LedgerBlock>,
    broken: HashSet<u64>,
    flaky: BTreeMap<u64, u32>,
}

/// In-memory chain. Heights can be marked broken (permanent error) or
/// flaky (transient errors for the first `n` reads).
#[derive(Default)]
pub struct MemoryChainReader {
    chain: Mutex<ScriptedChain>,
}

impl MemoryChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(blocks: impl IntoIterator<Item = LedgerBlock>) -> Self {
        let reader = Self::new();
        reader.extend(blocks);
        reader
    }

    pub fn extend(&self, blocks: impl IntoIterator<Item = LedgerBlock>) {
        let mut chain = lock(&self.chain);
        for b in blocks {
            chain.blocks.insert(b.height, b);
        }
    }

    pub fn break_height(&self, height: u64) {
        lock(&self.chain).broken.insert(height);
    }

    pub fn flake_height(&self, height: u64, failures: u32) {
        lock(&self.chain).flaky.insert(height, failures);
    }
}

#[async_trait]
impl ChainReader for MemoryChainReader {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        lock(&self.chain)
            .blocks
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| IndexerError::Rpc("chain is empty".into()))
    }

    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError> {
        let mut chain = lock(&self.chain);
        if chain.broken.contains(&height) {
            return Err(IndexerError::permanent(format!("block {height} is undecodable")));
        }
        if let Some(left) = chain.flaky.get_mut(&height) {
            if *left > 0 {
                *left -= 1;
                return Err(IndexerError::Rpc(format!("connection reset reading {height}")));
            }
        }
        Ok(chain.blocks.get(&height).cloned())
    }
}
