//! Pipeline configuration.
//!
//! Loaded from YAML, then overridden from the environment with the same knobs
//! operators already use in deployment:
//!
//! | Variable                    | Effect                                   |
//! |-----------------------------|------------------------------------------|
//! | `DB_URL`, `CHAIN_URL`       | database and chain endpoints             |
//! | `ENABLE_<WORKER>`           | `false` disables the worker              |
//! | `<WORKER>_RANGE`            | chunk size                               |
//! | `<WORKER>_CONCURRENCY`      | parallel chunks                          |
//! | `ENABLE_FORWARD_INGESTER`   | toggles the forward raw ingester         |
//! | `ENABLE_HISTORY_INGESTER`   | toggles the backward raw ingester        |
//! | `HISTORY_FLOOR`             | lowest height the backward ingester reaches |
//! | `LOG_LEVEL`, `LOG_JSON`     | logging                                  |

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::error::IndexerError;
use crate::policy::RetryConfig;
use crate::types::Direction;

pub const FORWARD_INGESTER: &str = "main_ingester";
pub const BACKWARD_INGESTER: &str = "history_ingester";

// ─── Logging ─────────────────────────────────────────────────────────────────

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `info,ledgermirror_core=debug`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

// ─── Workers ─────────────────────────────────────────────────────────────────

/// Settings for one derivation worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Heights per chunk.
    #[serde(default = "default_range_size")]
    pub range_size: u64,
    /// Chunks processed in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub direction: Direction,
    /// First height for a worker that has no checkpoint yet.
    #[serde(default)]
    pub start_height: Option<u64>,
    /// Upstream workers whose checkpoints cap what this worker may read.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Derive raw history backfilled below where a forward worker started.
    #[serde(default = "default_true")]
    pub derive_history: bool,
}

fn default_true() -> bool {
    true
}
fn default_range_size() -> u64 {
    1_000
}
fn default_concurrency() -> usize {
    1
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            range_size: default_range_size(),
            concurrency: default_concurrency(),
            direction: Direction::Forward,
            start_height: None,
            dependencies: Vec::new(),
            derive_history: true,
        }
    }
}

impl WorkerSettings {
    pub fn depends_on(mut self, upstream: &str) -> Self {
        self.dependencies.push(upstream.to_string());
        self
    }

    /// Candidate chunks scanned past the checkpoint per claim round.
    pub fn lookahead(&self) -> usize {
        (self.concurrency * 2).max(5)
    }
}

/// Default worker catalog with its dependency edges.
pub fn default_workers() -> BTreeMap<String, WorkerSettings> {
    let base = WorkerSettings::default;
    let mut workers = BTreeMap::new();
    workers.insert("token_worker".to_string(), base());
    workers.insert("evm_worker".to_string(), base());
    workers.insert("meta_worker".to_string(), base().depends_on("token_worker"));
    workers.insert("accounts_worker".to_string(), base());
    workers.insert("ft_holdings_worker".to_string(), base().depends_on("token_worker"));
    workers.insert("nft_ownership_worker".to_string(), base().depends_on("token_worker"));
    workers.insert("tx_contracts_worker".to_string(), base());
    workers.insert("tx_metrics_worker".to_string(), base());
    workers.insert("analytics_worker".to_string(), base().depends_on("tx_metrics_worker"));
    workers.insert("staking_worker".to_string(), base());
    workers.insert("account_keys_worker".to_string(), base());
    workers
}

// ─── Ingesters ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngesterSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Blocks per saved batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Parallel block fetches within a batch.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Initial checkpoint when none is stored. Forward defaults to the chain tip.
    #[serde(default)]
    pub start_height: Option<u64>,
    /// Lowest height a backward ingester fetches.
    #[serde(default)]
    pub floor: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_batch_size() -> u64 {
    50
}
fn default_fetch_concurrency() -> usize {
    10
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for IngesterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            fetch_concurrency: default_fetch_concurrency(),
            start_height: None,
            floor: 0,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl IngesterSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_backward_ingester() -> IngesterSettings {
    IngesterSettings {
        enabled: false,
        ..IngesterSettings::default()
    }
}

// ─── Metadata oracle ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Per-call timeout.
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
    /// Scripts tried in order until one returns metadata.
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Tokens enriched per pass.
    #[serde(default = "default_oracle_batch")]
    pub batch_limit: usize,
    #[serde(default = "default_oracle_interval_secs")]
    pub interval_secs: u64,
}

fn default_oracle_timeout_secs() -> u64 {
    12
}
fn default_oracle_batch() -> usize {
    50
}
fn default_oracle_interval_secs() -> u64 {
    60
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_oracle_timeout_secs(),
            scripts: Vec::new(),
            batch_limit: default_oracle_batch(),
            interval_secs: default_oracle_interval_secs(),
        }
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

/// Top-level configuration for a ledgermirror deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub chain_url: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub forward_ingester: IngesterSettings,
    #[serde(default = "default_backward_ingester")]
    pub backward_ingester: IngesterSettings,
    #[serde(default = "default_workers")]
    pub workers: BTreeMap<String, WorkerSettings>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Chunk deadline; exceeding it counts as a transient failure.
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Sleep between claim rounds when nothing is claimable.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_reprocess_concurrency")]
    pub max_reprocess_concurrency: usize,
    #[serde(default = "default_status_cache_ttl_secs")]
    pub status_cache_ttl_secs: u64,
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
    #[serde(default)]
    pub oracle: OracleConfig,
}

fn default_chunk_timeout_secs() -> u64 {
    120
}
fn default_lease_ttl_secs() -> u64 {
    300
}
fn default_max_reprocess_concurrency() -> usize {
    16
}
fn default_status_cache_ttl_secs() -> u64 {
    5
}
fn default_hub_capacity() -> usize {
    1_024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            chain_url: None,
            log: LogConfig::default(),
            forward_ingester: IngesterSettings::default(),
            backward_ingester: default_backward_ingester(),
            workers: default_workers(),
            retry: RetryConfig::default(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_reprocess_concurrency: default_max_reprocess_concurrency(),
            status_cache_ttl_secs: default_status_cache_ttl_secs(),
            hub_capacity: default_hub_capacity(),
            oracle: OracleConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, IndexerError> {
        serde_yaml::from_str(yaml).map_err(|e| IndexerError::config(format!("config yaml: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerSettings> {
        self.workers.get(name)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), IndexerError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), IndexerError> {
        if let Some(url) = lookup("DB_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("CHAIN_URL") {
            self.chain_url = Some(url);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(v) = lookup("LOG_JSON") {
            self.log.json = parse_bool("LOG_JSON", &v)?;
        }
        if let Some(v) = lookup("ENABLE_FORWARD_INGESTER") {
            self.forward_ingester.enabled = parse_bool("ENABLE_FORWARD_INGESTER", &v)?;
        }
        if let Some(v) = lookup("ENABLE_HISTORY_INGESTER") {
            self.backward_ingester.enabled = parse_bool("ENABLE_HISTORY_INGESTER", &v)?;
        }
        if let Some(v) = lookup("HISTORY_FLOOR") {
            self.backward_ingester.floor = parse_num("HISTORY_FLOOR", &v)?;
        }

        for (name, settings) in self.workers.iter_mut() {
            let prefix = name.to_uppercase();
            if let Some(v) = lookup(&format!("ENABLE_{prefix}")) {
                settings.enabled = parse_bool(&format!("ENABLE_{prefix}"), &v)?;
            }
            if let Some(v) = lookup(&format!("{prefix}_RANGE")) {
                settings.range_size = parse_num(&format!("{prefix}_RANGE"), &v)?;
            }
            if let Some(v) = lookup(&format!("{prefix}_CONCURRENCY")) {
                settings.concurrency = parse_num(&format!("{prefix}_CONCURRENCY"), &v)?;
            }
            if let Some(v) = lookup(&format!("{prefix}_HISTORY")) {
                settings.derive_history = parse_bool(&format!("{prefix}_HISTORY"), &v)?;
            }
        }
        Ok(())
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.forward_ingester.batch_size == 0 || self.backward_ingester.batch_size == 0 {
            return Err(IndexerError::config("ingester batch_size must be > 0"));
        }
        if self.max_reprocess_concurrency == 0 {
            return Err(IndexerError::config("max_reprocess_concurrency must be > 0"));
        }
        for (name, w) in &self.workers {
            if w.range_size == 0 {
                return Err(IndexerError::config(format!("{name}: range_size must be > 0")));
            }
            if w.concurrency == 0 {
                return Err(IndexerError::config(format!("{name}: concurrency must be > 0")));
            }
            for dep in &w.dependencies {
                if dep == name {
                    return Err(IndexerError::config(format!("{name}: depends on itself")));
                }
                if !self.workers.contains_key(dep) {
                    return Err(IndexerError::config(format!(
                        "{name}: unknown dependency '{dep}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, IndexerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(IndexerError::config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, IndexerError> {
    value
        .trim()
        .parse()
        .map_err(|_| IndexerError::config(format!("{key}: expected a number, got '{value}'")))
}
