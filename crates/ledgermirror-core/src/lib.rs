//! ledgermirror-core: checkpoint-driven incremental indexing of an append-only ledger.
//!
//! # Architecture
//!
//! ```text
//! RawIngester (forward / backward) ──► RawLedgerStore ──► FanoutHub
//!        │ advances                          │ read by
//!        ▼                                   ▼
//! CheckpointStore ◄── RangeScheduler ◄── AsyncWorker ──► Processor ──► DerivedStore
//!                          │                 │
//!                      LeaseStore        ErrorLedger (errors + skipped ranges)
//!
//! RecoveryController: reset / redirect / reprocess jobs (JobRegistry)
//! StatusSurface:      checkpoint heights behind an injected Cache
//! ```

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod derived;
pub mod error;
pub mod hub;
pub mod job;
pub mod lease;
pub mod ledger;
pub mod policy;
pub mod recovery;
pub mod scheduler;
pub mod status;
pub mod tracker;
pub mod types;
pub mod worker;

pub use cache::{Cache, MemoryCache};
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
pub use config::{PipelineConfig, WorkerSettings, BACKWARD_INGESTER, FORWARD_INGESTER};
pub use derived::DerivedStore;
pub use error::{ErrorClass, IndexerError};
pub use hub::{FanoutHub, HubEvent};
pub use job::{JobSnapshot, JobStatus, JobTicket};
pub use lease::{Lease, LeaseStore, MemoryLeaseStore};
pub use ledger::{LedgerBlock, LedgerEvent, LedgerTransaction, RawLedgerStore};
pub use policy::{RetryConfig, RetryPolicy};
pub use recovery::RecoveryController;
pub use scheduler::{history_cursor, RangeScheduler};
pub use status::StatusSurface;
pub use tracker::{ErrorLedger, MemoryErrorLedger};
pub use types::{Direction, HeightRange, Watermark};
pub use worker::{AsyncWorker, ChunkOutcome, Lane, Processor, WorkerRuntime};
