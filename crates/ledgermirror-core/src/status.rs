//! Read-only status surface for dashboards and pollers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::checkpoint::CheckpointStore;
use crate::config::{PipelineConfig, WorkerSettings, BACKWARD_INGESTER, FORWARD_INGESTER};
use crate::error::IndexerError;
use crate::scheduler::history_cursor;
use crate::types::Direction;

const CACHE_KEY: &str = "status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub height: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub range_size: u64,
    pub concurrency: usize,
    pub enabled: bool,
    pub direction: Direction,
    /// Lowest height the history lane has derived down to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngesterStatus {
    pub name: String,
    pub height: u64,
    pub enabled: bool,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub ingesters: Vec<IngesterStatus>,
    pub workers: Vec<WorkerStatus>,
    pub taken_at: DateTime<Utc>,
}

pub struct StatusSurface {
    checkpoints: Arc<dyn CheckpointStore>,
    workers: BTreeMap<String, WorkerSettings>,
    ingesters: Vec<(String, bool, Direction)>,
    cache: Arc<dyn Cache<StatusSnapshot>>,
    ttl: Duration,
}

impl StatusSurface {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        config: &PipelineConfig,
        cache: Arc<dyn Cache<StatusSnapshot>>,
    ) -> Self {
        Self {
            checkpoints,
            workers: config.workers.clone(),
            ingesters: vec![
                (FORWARD_INGESTER.to_string(), config.forward_ingester.enabled, Direction::Forward),
                (BACKWARD_INGESTER.to_string(), config.backward_ingester.enabled, Direction::Backward),
            ],
            cache,
            ttl: Duration::from_secs(config.status_cache_ttl_secs),
        }
    }

    /// Cached snapshot, refreshed once the TTL has passed.
    pub async fn snapshot(&self) -> Result<StatusSnapshot, IndexerError> {
        if let Some(hit) = self.cache.get(CACHE_KEY) {
            return Ok(hit);
        }
        let fresh = self.load().await?;
        self.cache.set(CACHE_KEY, fresh.clone(), self.ttl);
        Ok(fresh)
    }

    async fn load(&self) -> Result<StatusSnapshot, IndexerError> {
        let mut ingesters = Vec::with_capacity(self.ingesters.len());
        for (name, enabled, direction) in &self.ingesters {
            ingesters.push(IngesterStatus {
                name: name.clone(),
                height: self.checkpoints.get_height(name).await?,
                enabled: *enabled,
                direction: *direction,
            });
        }

        let mut workers = Vec::with_capacity(self.workers.len());
        for (name, settings) in &self.workers {
            let cp = self.checkpoints.load(name).await?;
            let history = self.checkpoints.load(&history_cursor(name)).await?;
            workers.push(WorkerStatus {
                name: name.clone(),
                height: cp.as_ref().map(|c| c.height).unwrap_or(0),
                updated_at: cp.map(|c| c.updated_at),
                range_size: settings.range_size,
                concurrency: settings.concurrency,
                enabled: settings.enabled,
                direction: settings.direction,
                history_height: history.map(|h| h.height),
            });
        }

        Ok(StatusSnapshot {
            ingesters,
            workers,
            taken_at: Utc::now(),
        })
    }
}
