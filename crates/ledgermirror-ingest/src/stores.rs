//! The set of stores a pipeline runs against.

use std::sync::Arc;

use ledgermirror_core::checkpoint::CheckpointStore;
use ledgermirror_core::derived::DerivedStore;
use ledgermirror_core::lease::LeaseStore;
use ledgermirror_core::ledger::RawLedgerStore;
use ledgermirror_core::tracker::ErrorLedger;

/// Handles to every store, usually all backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub tracker: Arc<dyn ErrorLedger>,
    pub raw: Arc<dyn RawLedgerStore>,
    pub derived: Arc<dyn DerivedStore>,
}

impl Stores {
    /// Use one backend for every role.
    pub fn shared<S>(backend: Arc<S>) -> Self
    where
        S: CheckpointStore + LeaseStore + ErrorLedger + RawLedgerStore + DerivedStore + 'static,
    {
        Self {
            checkpoints: backend.clone(),
            leases: backend.clone(),
            tracker: backend.clone(),
            raw: backend.clone(),
            derived: backend,
        }
    }
}
