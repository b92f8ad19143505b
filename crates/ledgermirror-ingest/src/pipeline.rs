//! Wires stores, the chain reader, ingesters, workers and recovery into one
//! running pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledgermirror_core::PipelineConfig;
//! use ledgermirror_ingest::{pipeline::PipelineBuilder, reader::MemoryChainReader, stores::Stores};
//! # fn stores() -> Stores { unimplemented!() }
//!
//! # async fn demo() -> Result<(), ledgermirror_core::IndexerError> {
//! let pipeline = PipelineBuilder::new(PipelineConfig::default())
//!     .stores(stores())
//!     .reader(Arc::new(MemoryChainReader::new()))
//!     .build()?;
//! let cancel = tokio_util::sync::CancellationToken::new();
//! pipeline.run(cancel).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ledgermirror_core::cache::MemoryCache;
use ledgermirror_core::config::{PipelineConfig, BACKWARD_INGESTER, FORWARD_INGESTER};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::hub::FanoutHub;
use ledgermirror_core::policy::RetryPolicy;
use ledgermirror_core::recovery::RecoveryController;
use ledgermirror_core::status::{StatusSnapshot, StatusSurface};
use ledgermirror_core::types::Direction;
use ledgermirror_core::worker::{AsyncWorker, Processor, WorkerRuntime};

use crate::ingester::RawIngester;
use crate::oracle::{FallbackOracle, MetadataEnricher, MetadataOracle};
use crate::reader::{ChainReader, RetryingReader};
use crate::stores::Stores;
use crate::workers::standard_workers;

/// Fluent builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    stores: Option<Stores>,
    reader: Option<Arc<dyn ChainReader>>,
    hub: Option<FanoutHub>,
    oracle: Option<Arc<dyn MetadataOracle>>,
    holder: Option<String>,
    processors: Option<Vec<Arc<dyn Processor>>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stores: None,
            reader: None,
            hub: None,
            oracle: None,
            holder: None,
            processors: None,
        }
    }

    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Required when either ingester is enabled.
    pub fn reader(mut self, reader: Arc<dyn ChainReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Share an existing hub instead of creating one.
    pub fn hub(mut self, hub: FanoutHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn MetadataOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Lease holder id. Defaults to a random one per process.
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Replace the built-in worker catalog.
    pub fn processors(mut self, processors: Vec<Arc<dyn Processor>>) -> Self {
        self.processors = Some(processors);
        self
    }

    pub fn build(self) -> Result<Pipeline, IndexerError> {
        let config = self.config;
        config.validate()?;

        let stores = self
            .stores
            .ok_or_else(|| IndexerError::config("pipeline needs stores"))?;
        let ingesting = config.forward_ingester.enabled || config.backward_ingester.enabled;
        if ingesting && self.reader.is_none() {
            return Err(IndexerError::config("an enabled ingester needs a chain reader"));
        }

        let holder = self
            .holder
            .unwrap_or_else(|| format!("ledgermirror-{}", uuid::Uuid::new_v4()));
        let runtime = WorkerRuntime {
            checkpoints: stores.checkpoints.clone(),
            leases: stores.leases.clone(),
            tracker: stores.tracker.clone(),
            raw: stores.raw.clone(),
            ingester: FORWARD_INGESTER.to_string(),
            holder,
            policy: RetryPolicy::new(config.retry.clone()),
            chunk_timeout: config.chunk_timeout(),
            lease_ttl: config.lease_ttl(),
            poll_interval: config.poll_interval(),
        };

        let processors = self.processors.unwrap_or_else(|| standard_workers(&stores));
        let mut recovery =
            RecoveryController::new(runtime.clone(), BACKWARD_INGESTER, config.max_reprocess_concurrency);
        for processor in &processors {
            let direction = config
                .worker(processor.name())
                .map(|w| w.direction)
                .unwrap_or(Direction::Forward);
            recovery.register(Arc::clone(processor), direction);
        }

        let status = StatusSurface::new(
            stores.checkpoints.clone(),
            &config,
            Arc::new(MemoryCache::<StatusSnapshot>::new()),
        );
        let hub = self.hub.unwrap_or_else(|| FanoutHub::new(config.hub_capacity));

        Ok(Pipeline {
            config,
            stores,
            reader: self.reader,
            oracle: self.oracle,
            hub,
            runtime,
            processors,
            recovery: Arc::new(recovery),
            status: Arc::new(status),
        })
    }
}

/// A configured pipeline. [`Pipeline::run`] drives it until cancelled; the
/// recovery and status handles stay usable while it runs.
pub struct Pipeline {
    config: PipelineConfig,
    stores: Stores,
    reader: Option<Arc<dyn ChainReader>>,
    oracle: Option<Arc<dyn MetadataOracle>>,
    hub: FanoutHub,
    runtime: WorkerRuntime,
    processors: Vec<Arc<dyn Processor>>,
    recovery: Arc<RecoveryController>,
    status: Arc<StatusSurface>,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    pub fn recovery(&self) -> Arc<RecoveryController> {
        Arc::clone(&self.recovery)
    }

    pub fn status(&self) -> Arc<StatusSurface> {
        Arc::clone(&self.status)
    }

    pub fn hub(&self) -> &FanoutHub {
        &self.hub
    }

    /// Worker loops for every enabled worker, in catalog order.
    pub fn workers(&self) -> Vec<Arc<AsyncWorker>> {
        self.processors
            .iter()
            .filter_map(|p| {
                let settings = self.config.worker(p.name())?;
                settings.enabled.then(|| {
                    Arc::new(AsyncWorker::new(Arc::clone(p), settings.clone(), self.runtime.clone()))
                })
            })
            .collect()
    }

    fn ingesters(&self) -> Vec<Arc<RawIngester>> {
        let Some(reader) = &self.reader else {
            return Vec::new();
        };
        let reader: Arc<dyn ChainReader> =
            Arc::new(RetryingReader::new(Arc::clone(reader), self.runtime.policy.clone()));

        let mut out = Vec::new();
        for (name, direction, settings) in [
            (FORWARD_INGESTER, Direction::Forward, &self.config.forward_ingester),
            (BACKWARD_INGESTER, Direction::Backward, &self.config.backward_ingester),
        ] {
            if settings.enabled {
                let ingester = RawIngester::new(
                    name,
                    direction,
                    settings.clone(),
                    Arc::clone(&reader),
                    self.stores.clone(),
                )
                .with_hub(self.hub.clone());
                out.push(Arc::new(ingester));
            }
        }
        out
    }

    fn enricher(&self) -> Option<Arc<MetadataEnricher>> {
        if !self.config.oracle.enabled {
            return None;
        }
        let oracle = self.oracle.as_ref()?;
        let fallback = FallbackOracle::from_config(Arc::clone(oracle), &self.config.oracle);
        Some(Arc::new(MetadataEnricher::new(
            self.stores.derived.clone(),
            fallback,
            &self.config.oracle,
        )))
    }

    /// Run every enabled component until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexerError> {
        let mut tasks: JoinSet<(String, Result<(), IndexerError>)> = JoinSet::new();

        for ingester in self.ingesters() {
            let name = ingester.name().to_string();
            let token = cancel.clone();
            tasks.spawn(async move { (name, ingester.run(token).await) });
        }
        for worker in self.workers() {
            let name = worker.name().to_string();
            let token = cancel.clone();
            tasks.spawn(async move { (name, worker.run(token).await) });
        }
        if let Some(enricher) = self.enricher() {
            let token = cancel.clone();
            tasks.spawn(async move { ("metadata_enricher".to_string(), enricher.run(token).await) });
        }

        info!(tasks = tasks.len(), holder = %self.runtime.holder, "pipeline started");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    error!(task = %name, error = %e, "pipeline task failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "pipeline task panicked");
                    first_error.get_or_insert(IndexerError::Other(format!("task panicked: {e}")));
                }
            }
        }

        info!("pipeline stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryChainReader;
    use crate::workers::testutil::block;
    use ledgermirror_storage::InMemoryStorage;

    fn stores() -> Stores {
        Stores::shared(Arc::new(InMemoryStorage::new()))
    }

    #[test]
    fn ingesting_without_reader_is_rejected() {
        let err = PipelineBuilder::new(PipelineConfig::default())
            .stores(stores())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn registers_every_worker_for_recovery() {
        let mut config = PipelineConfig::default();
        config.forward_ingester.enabled = false;
        config.workers.get_mut("evm_worker").unwrap().enabled = false;

        let pipeline = PipelineBuilder::new(config)
            .stores(stores())
            .holder("node-a")
            .build()
            .unwrap();
        assert_eq!(pipeline.recovery().worker_names().len(), 11);
        assert_eq!(pipeline.workers().len(), 10);
        assert_eq!(pipeline.runtime().holder, "node-a");
        assert!(pipeline.ingesters().is_empty());
    }

    #[tokio::test]
    async fn run_returns_after_cancel() {
        let mut config = PipelineConfig::default();
        config.poll_interval_ms = 10;
        let pipeline = PipelineBuilder::new(config)
            .stores(stores())
            .reader(Arc::new(MemoryChainReader::with_blocks([block(1)])))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stopper.cancel();
        });
        pipeline.run(cancel).await.unwrap();
    }
}
