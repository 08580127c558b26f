pub mod config;
pub mod covenant;
pub mod data_store;
pub mod deadlock;
pub mod errors;
pub mod log;
pub mod manager;
pub mod stats;
pub mod storage;
pub mod tid;
pub mod twopc;

// Re-export key types and structs for easier access
pub use crate::config::CovenantConfig;
pub use crate::covenant::{Covenant, WriteObserver};
pub use crate::data_store::object::{DistObject, ObjectImage, Oid};
pub use crate::data_store::object_cache::ObjectCache;
pub use crate::data_store::read_map::{ReadEntry, ReadMap};
pub use crate::deadlock::DeadlockDetector;
pub use crate::errors::{CovenantError, Result};
pub use crate::log::{CommitPhase, CommitState, LabelCache, Log, RetryCause, RetrySignal, WriterMap};
pub use crate::manager::{Backoff, FailureMap, TransactionManager};
pub use crate::stats::TxnStats;
pub use crate::storage::LocalStore;
pub use crate::tid::TransactionId;
pub use crate::twopc::{
    ExtendedWarranty, LockIntents, Participant, ParticipantError, PrepareWritesRequest,
    PrepareWritesResult, ReadVersion, RemoteWorker, Store,
};

/// Everything needed to run transactions against a [`Covenant`].
pub mod prelude {
    pub use crate::config::CovenantConfig;
    pub use crate::covenant::{Covenant, WriteObserver};
    pub use crate::data_store::object::{DistObject, ObjectImage, Oid};
    pub use crate::errors::{CovenantError, Result};
    pub use crate::manager::TransactionManager;
    pub use crate::tid::TransactionId;
    pub use crate::twopc::{
        ExtendedWarranty, Participant, ParticipantError, PrepareWritesRequest,
        PrepareWritesResult, ReadVersion, RemoteWorker, Store,
    };
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn current_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
