//! Common utilities for covenant integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use covenant::{
    Covenant, CovenantConfig, DistObject, ExtendedWarranty, ObjectImage, Oid, ParticipantError,
    PrepareWritesRequest, PrepareWritesResult, ReadVersion, RemoteWorker, Store, TransactionId,
    current_time_millis,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

// --- MockStore ---

/// One protocol call received by a [`MockStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    PrepareWrites {
        creates: Vec<u64>,
        writes: Vec<u64>,
        lock_acquires: Vec<u64>,
    },
    PrepareReads {
        reads: Vec<ReadVersion>,
        commit_time: u64,
    },
    Commit {
        commit_time: u64,
        was_contacted: bool,
    },
    Abort,
    StaleCheck(Vec<ReadVersion>),
    Extensions(Vec<u64>),
}

/// A remote store living in memory. Records every call and can be told to fail
/// any of the protocol steps.
pub struct MockStore {
    name: String,
    next_onum: AtomicU64,
    calls: Mutex<Vec<StoreCall>>,
    committed: Mutex<HashMap<u64, ObjectImage>>,
    prepared: Mutex<HashMap<TransactionId, PrepareWritesRequest>>,
    proposed_commit_time: AtomicU64,
    fail_prepare_writes: Mutex<Option<ParticipantError>>,
    fail_prepare_reads: Mutex<Option<ParticipantError>>,
    fail_commit: Mutex<Option<ParticipantError>>,
    stale: Mutex<Vec<ObjectImage>>,
    warranty_expiry: AtomicU64,
    prepare_gate: Mutex<Option<(Arc<Barrier>, Arc<Barrier>)>>,
}

impl MockStore {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            next_onum: AtomicU64::new(100),
            calls: Mutex::new(Vec::new()),
            committed: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
            proposed_commit_time: AtomicU64::new(0),
            fail_prepare_writes: Mutex::new(None),
            fail_prepare_reads: Mutex::new(None),
            fail_commit: Mutex::new(None),
            stale: Mutex::new(Vec::new()),
            warranty_expiry: AtomicU64::new(0),
            prepare_gate: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&StoreCall) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    /// Makes the next prepare-writes block. It waits on the first barrier once
    /// it has started and on the second before it answers.
    pub fn block_next_prepare(&self) -> (Arc<Barrier>, Arc<Barrier>) {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        *self.prepare_gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub fn committed(&self, onum: u64) -> Option<ObjectImage> {
        self.committed.lock().unwrap().get(&onum).cloned()
    }

    /// Makes prepare-writes propose `commit_time` instead of the current time.
    pub fn propose_commit_time(&self, commit_time: u64) {
        self.proposed_commit_time.store(commit_time, Ordering::SeqCst);
    }

    pub fn fail_prepare_writes(&self, error: ParticipantError) {
        *self.fail_prepare_writes.lock().unwrap() = Some(error);
    }

    pub fn fail_prepare_reads(&self, error: ParticipantError) {
        *self.fail_prepare_reads.lock().unwrap() = Some(error);
    }

    pub fn fail_commit(&self, error: ParticipantError) {
        *self.fail_commit.lock().unwrap() = Some(error);
    }

    /// Images returned by the next stale-object checks.
    pub fn report_stale(&self, images: Vec<ObjectImage>) {
        *self.stale.lock().unwrap() = images;
    }

    /// Grants warranties until `expiry` on every validated read.
    pub fn grant_warranties_until(&self, expiry: u64) {
        self.warranty_expiry.store(expiry, Ordering::SeqCst);
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Store for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_onum(&self) -> Result<u64, ParticipantError> {
        Ok(self.next_onum.fetch_add(1, Ordering::SeqCst))
    }

    fn prepare_transaction_writes(
        &self,
        tid: &TransactionId,
        request: &PrepareWritesRequest,
    ) -> Result<PrepareWritesResult, ParticipantError> {
        let mut creates: Vec<u64> = request.creates.iter().map(|i| i.oid.onum).collect();
        let mut writes: Vec<u64> = request.writes.iter().map(|i| i.oid.onum).collect();
        creates.sort();
        writes.sort();
        self.record(StoreCall::PrepareWrites {
            creates,
            writes,
            lock_acquires: request.locks.acquires.clone(),
        });
        let gate = self.prepare_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.wait();
            release.wait();
        }
        if let Some(error) = self.fail_prepare_writes.lock().unwrap().clone() {
            return Err(error);
        }
        self.prepared
            .lock()
            .unwrap()
            .insert(tid.clone(), request.clone());
        let proposed = self.proposed_commit_time.load(Ordering::SeqCst);
        Ok(PrepareWritesResult {
            commit_time: if proposed > 0 {
                proposed
            } else {
                current_time_millis()
            },
            added_reads: Vec::new(),
        })
    }

    fn prepare_transaction_reads(
        &self,
        _tid: &TransactionId,
        reads: &[ReadVersion],
        commit_time: u64,
    ) -> Result<Vec<ExtendedWarranty>, ParticipantError> {
        self.record(StoreCall::PrepareReads {
            reads: reads.to_vec(),
            commit_time,
        });
        if let Some(error) = self.fail_prepare_reads.lock().unwrap().clone() {
            return Err(error);
        }
        let expiry = self.warranty_expiry.load(Ordering::SeqCst);
        if expiry == 0 {
            return Ok(Vec::new());
        }
        Ok(reads
            .iter()
            .map(|read| ExtendedWarranty {
                onum: read.onum,
                expiry,
            })
            .collect())
    }

    fn commit_transaction(
        &self,
        tid: &TransactionId,
        commit_time: u64,
        was_contacted: bool,
    ) -> Result<(), ParticipantError> {
        self.record(StoreCall::Commit {
            commit_time,
            was_contacted,
        });
        if let Some(error) = self.fail_commit.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(request) = self.prepared.lock().unwrap().remove(tid) {
            let mut committed = self.committed.lock().unwrap();
            for image in request.creates.into_iter().chain(request.writes) {
                committed.insert(
                    image.oid.onum,
                    ObjectImage {
                        version: image.version + 1,
                        ..image
                    },
                );
            }
        }
        Ok(())
    }

    fn abort_transaction(&self, tid: &TransactionId) -> Result<(), ParticipantError> {
        self.record(StoreCall::Abort);
        self.prepared.lock().unwrap().remove(tid);
        Ok(())
    }

    fn check_for_stale_objects(
        &self,
        reads: &[ReadVersion],
    ) -> Result<Vec<ObjectImage>, ParticipantError> {
        self.record(StoreCall::StaleCheck(reads.to_vec()));
        Ok(self.stale.lock().unwrap().clone())
    }

    fn send_extensions(&self, onums: &[u64]) -> Result<(), ParticipantError> {
        self.record(StoreCall::Extensions(onums.to_vec()));
        Ok(())
    }
}

// --- MockWorker ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCall {
    PrepareWrites,
    PrepareReads(u64),
    Commit(u64),
    Abort,
    StaleCheck,
    TakeOwnership(Oid),
    ReadObject(Oid),
}

/// Another worker that ran part of a transaction.
pub struct MockWorker {
    name: String,
    calls: Mutex<Vec<WorkerCall>>,
    refuse_ownership: AtomicUsize,
    stale: Mutex<bool>,
    images: Mutex<HashMap<Oid, ObjectImage>>,
    fail_prepare_writes: Mutex<Option<ParticipantError>>,
}

impl MockWorker {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            refuse_ownership: AtomicUsize::new(0),
            stale: Mutex::new(false),
            images: Mutex::new(HashMap::new()),
            fail_prepare_writes: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Refuses the next `times` ownership transfers.
    pub fn refuse_ownership(&self, times: usize) {
        self.refuse_ownership.store(times, Ordering::SeqCst);
    }

    pub fn report_stale(&self, stale: bool) {
        *self.stale.lock().unwrap() = stale;
    }

    pub fn serve(&self, image: ObjectImage) {
        self.images.lock().unwrap().insert(image.oid.clone(), image);
    }

    pub fn fail_prepare_writes(&self, error: ParticipantError) {
        *self.fail_prepare_writes.lock().unwrap() = Some(error);
    }

    fn record(&self, call: WorkerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RemoteWorker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_transaction_writes(&self, _tid: &TransactionId) -> Result<u64, ParticipantError> {
        self.record(WorkerCall::PrepareWrites);
        if let Some(error) = self.fail_prepare_writes.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(current_time_millis())
    }

    fn prepare_transaction_reads(
        &self,
        _tid: &TransactionId,
        commit_time: u64,
    ) -> Result<(), ParticipantError> {
        self.record(WorkerCall::PrepareReads(commit_time));
        Ok(())
    }

    fn commit_transaction(
        &self,
        _tid: &TransactionId,
        commit_time: u64,
    ) -> Result<(), ParticipantError> {
        self.record(WorkerCall::Commit(commit_time));
        Ok(())
    }

    fn abort_transaction(&self, _tid: &TransactionId) -> Result<(), ParticipantError> {
        self.record(WorkerCall::Abort);
        Ok(())
    }

    fn check_for_stale_objects(&self, _tid: &TransactionId) -> Result<bool, ParticipantError> {
        self.record(WorkerCall::StaleCheck);
        Ok(*self.stale.lock().unwrap())
    }

    fn take_ownership(&self, _tid: &TransactionId, oid: &Oid) -> Result<(), ParticipantError> {
        self.record(WorkerCall::TakeOwnership(oid.clone()));
        let refusals = self.refuse_ownership.load(Ordering::SeqCst);
        if refusals > 0 {
            self.refuse_ownership.store(refusals - 1, Ordering::SeqCst);
            return Err(ParticipantError::Other(format!("{} is busy", oid)));
        }
        Ok(())
    }

    fn read_object(&self, _tid: &TransactionId, oid: &Oid) -> Result<ObjectImage, ParticipantError> {
        self.record(WorkerCall::ReadObject(oid.clone()));
        self.images
            .lock()
            .unwrap()
            .get(oid)
            .cloned()
            .ok_or_else(|| ParticipantError::Unreachable(format!("{} not cached", oid)))
    }
}

// --- Helper Functions ---

/// Test configuration: no backoff sleeps, short long-poll so failures show up fast.
pub fn test_config() -> CovenantConfig {
    CovenantConfig {
        worker_name: "w0".to_string(),
        use_backoff: false,
        ..CovenantConfig::default()
    }
}

/// A covenant with the local store only.
pub fn setup_covenant() -> Arc<Covenant> {
    Covenant::new(test_config())
}

/// A covenant with the given remote stores registered.
pub fn setup_with_stores(stores: &[&Arc<MockStore>]) -> Arc<Covenant> {
    let covenant = setup_covenant();
    for store in stores {
        covenant.add_store((*store).clone());
    }
    covenant
}

/// Caches an object that already exists on `store` at version 1.
pub fn remote_object(covenant: &Covenant, store: &str, onum: u64, payload: &[u8]) -> DistObject {
    covenant.cached_object(ObjectImage {
        oid: Oid::new(store, onum),
        version: 1,
        payload: payload.to_vec(),
    })
}

/// Creates and commits a local object holding `payload`.
pub fn committed_local_object(covenant: &Arc<Covenant>, payload: &[u8]) -> DistObject {
    let mut tm = covenant.transaction_manager();
    tm.start_transaction().unwrap();
    let local = covenant.config().local_store_name.clone();
    let object = covenant.new_object(&mut tm, &local, payload.to_vec()).unwrap();
    tm.commit_transaction().unwrap();
    object
}

pub fn encode(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
