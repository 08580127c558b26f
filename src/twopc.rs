use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data_store::object::{ObjectImage, Oid};
use crate::tid::TransactionId;

/// A node taking part in the two-phase commit of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Participant {
    Store(String),
    Worker(String),
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participant::Store(name) => write!(f, "store {}", name),
            Participant::Worker(name) => write!(f, "worker {}", name),
        }
    }
}

/// Error type for participant operations.
///
/// Stores and workers return this from every protocol call. The manager
/// collects these per participant before deciding between restart and fatal
/// failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParticipantError {
    /// The participant refused to prepare. `conflicts` carries fresher copies
    /// of the objects that caused the rejection, if the participant sent any.
    #[error("Prepare rejected: {reason}")]
    PrepareFailed {
        reason: String,
        conflicts: Vec<ObjectImage>,
    },
    /// The participant could not be reached.
    #[error("Participant unreachable: {0}")]
    Unreachable(String),
    #[error("Other participant error: {0}")]
    Other(String),
}

impl ParticipantError {
    pub fn conflicts(&self) -> &[ObjectImage] {
        match self {
            ParticipantError::PrepareFailed { conflicts, .. } => conflicts,
            _ => &[],
        }
    }
}

/// Version of an object as read by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadVersion {
    pub onum: u64,
    pub version: u64,
}

/// A warranty a store granted or extended during prepare-reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedWarranty {
    pub onum: u64,
    /// New expiry, in milliseconds since the epoch.
    pub expiry: u64,
}

/// Pessimistic lock intents accumulated by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockIntents {
    pub acquires: Vec<u64>,
    pub releases: Vec<u64>,
    pub created: Vec<u64>,
}

impl LockIntents {
    pub fn is_empty(&self) -> bool {
        self.acquires.is_empty() && self.releases.is_empty() && self.created.is_empty()
    }
}

/// Objects shipped to one store in phase one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareWritesRequest {
    pub creates: Vec<ObjectImage>,
    pub writes: Vec<ObjectImage>,
    pub locks: LockIntents,
}

impl PrepareWritesRequest {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.writes.is_empty() && self.locks.is_empty()
    }
}

/// A store's answer to a successful prepare-writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareWritesResult {
    /// Earliest time at which the store can make the writes visible, given the
    /// warranties outstanding on the overwritten objects.
    pub commit_time: u64,
    /// Reads the store wants validated together with the writes.
    pub added_reads: Vec<ReadVersion>,
}

/// A durable object repository taking part in two-phase commit.
///
/// Implementations must be `Send` and `Sync`; the manager calls them from
/// several threads at once during fan-out.
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the store lives in this process. Reads of local objects are never
    /// validated remotely.
    fn is_local(&self) -> bool {
        false
    }

    /// Allocates a fresh object number.
    fn new_onum(&self) -> Result<u64, ParticipantError>;

    /// Phase 1: ship creates and writes and obtain a proposed commit time.
    fn prepare_transaction_writes(
        &self,
        tid: &TransactionId,
        request: &PrepareWritesRequest,
    ) -> Result<PrepareWritesResult, ParticipantError>;

    /// Phase 2: validate the read set and extend warranties up to `commit_time`.
    fn prepare_transaction_reads(
        &self,
        tid: &TransactionId,
        reads: &[ReadVersion],
        commit_time: u64,
    ) -> Result<Vec<ExtendedWarranty>, ParticipantError>;

    /// Phase 3. `was_contacted` tells the store whether it saw a prepare for
    /// `tid`.
    fn commit_transaction(
        &self,
        tid: &TransactionId,
        commit_time: u64,
        was_contacted: bool,
    ) -> Result<(), ParticipantError>;

    fn abort_transaction(&self, tid: &TransactionId) -> Result<(), ParticipantError>;

    /// Returns fresher images for every read that is out of date.
    fn check_for_stale_objects(
        &self,
        reads: &[ReadVersion],
    ) -> Result<Vec<ObjectImage>, ParticipantError>;

    /// Asks the store to extend the warranties of `onums`.
    fn send_extensions(&self, onums: &[u64]) -> Result<(), ParticipantError>;
}

/// Another worker that executed part of a transaction.
pub trait RemoteWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Phase 1 for the sub-work done on the worker; returns its commit time.
    fn prepare_transaction_writes(&self, tid: &TransactionId) -> Result<u64, ParticipantError>;

    fn prepare_transaction_reads(
        &self,
        tid: &TransactionId,
        commit_time: u64,
    ) -> Result<(), ParticipantError>;

    fn commit_transaction(
        &self,
        tid: &TransactionId,
        commit_time: u64,
    ) -> Result<(), ParticipantError>;

    fn abort_transaction(&self, tid: &TransactionId) -> Result<(), ParticipantError>;

    fn check_for_stale_objects(&self, tid: &TransactionId) -> Result<bool, ParticipantError>;

    /// Transfers exclusive ownership of `oid` to the calling worker.
    fn take_ownership(&self, tid: &TransactionId, oid: &Oid) -> Result<(), ParticipantError>;

    /// Fetches the worker's current copy of `oid`.
    fn read_object(&self, tid: &TransactionId, oid: &Oid)
    -> Result<ObjectImage, ParticipantError>;
}
