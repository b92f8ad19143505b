//! ledgermirror-ingest: raw ingesters, chain readers and derivation workers.
//!
//! The forward ingester mirrors new blocks into the raw ledger and advances
//! `main_ingester`; the backward ingester fills history down to a floor and
//! moves `history_ingester` down. Derivation workers read the raw ledger
//! behind that watermark and write their own tables.
//!
//! [`pipeline::PipelineBuilder`] wires everything together.

pub mod ingester;
pub mod oracle;
pub mod payload;
pub mod pipeline;
pub mod reader;
pub mod stores;
pub mod workers;

pub use ingester::{IngestStep, RawIngester};
pub use oracle::{FallbackOracle, HttpScriptOracle, MetadataEnricher, MetadataOracle};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use reader::{ChainReader, HttpChainReader, MemoryChainReader, RetryingReader};
pub use stores::Stores;
pub use workers::standard_workers;
