//! ledgermirror-storage: pluggable storage backends for LedgerMirror.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - `postgres`: PostgreSQL via `sqlx` (feature `postgres`)
//!
//! Each backend implements every store trait from `ledgermirror-core`, so one
//! value can be shared as checkpoint store, lease table, error ledger, raw
//! ledger and derived store.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{DerivedTables, InMemoryStorage};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStorage};
