use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::current_time_millis;
use crate::data_store::object::{ObjectImage, Oid};
use crate::tid::TransactionId;
use crate::twopc::{
    ExtendedWarranty, ParticipantError, PrepareWritesRequest, PrepareWritesResult, ReadVersion,
    Store,
};

/// The in-process store.
///
/// Objects on this store are never shared with other workers, so preparing
/// them cannot fail and reads of them never need validation. The store still
/// keeps the committed version of every object so that
/// [`Store::check_for_stale_objects`] stays meaningful.
pub struct LocalStore {
    name: String,
    next_onum: AtomicU64,
    committed: Mutex<HashMap<u64, ObjectImage>>,
    prepared: Mutex<HashMap<TransactionId, PrepareWritesRequest>>,
}

impl LocalStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_onum: AtomicU64::new(1),
            committed: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
        }
    }

    /// The committed image of `onum`, if the store has one.
    pub fn committed(&self, onum: u64) -> Option<ObjectImage> {
        self.committed.lock().get(&onum).cloned()
    }
}

impl Store for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        true
    }

    fn new_onum(&self) -> Result<u64, ParticipantError> {
        Ok(self.next_onum.fetch_add(1, Ordering::SeqCst))
    }

    fn prepare_transaction_writes(
        &self,
        tid: &TransactionId,
        request: &PrepareWritesRequest,
    ) -> Result<PrepareWritesResult, ParticipantError> {
        self.prepared.lock().insert(tid.clone(), request.clone());
        Ok(PrepareWritesResult {
            commit_time: current_time_millis(),
            added_reads: Vec::new(),
        })
    }

    fn prepare_transaction_reads(
        &self,
        _tid: &TransactionId,
        _reads: &[ReadVersion],
        _commit_time: u64,
    ) -> Result<Vec<ExtendedWarranty>, ParticipantError> {
        Ok(Vec::new())
    }

    fn commit_transaction(
        &self,
        tid: &TransactionId,
        _commit_time: u64,
        _was_contacted: bool,
    ) -> Result<(), ParticipantError> {
        let Some(request) = self.prepared.lock().remove(tid) else {
            return Ok(());
        };
        let mut committed = self.committed.lock();
        for image in request.creates.into_iter().chain(request.writes) {
            let version = image.version + 1;
            committed.insert(
                image.oid.onum,
                ObjectImage {
                    oid: Oid::new(self.name.clone(), image.oid.onum),
                    version,
                    payload: image.payload,
                },
            );
        }
        debug!("Local store {} committed {}", self.name, tid);
        Ok(())
    }

    fn abort_transaction(&self, tid: &TransactionId) -> Result<(), ParticipantError> {
        self.prepared.lock().remove(tid);
        Ok(())
    }

    fn check_for_stale_objects(
        &self,
        reads: &[ReadVersion],
    ) -> Result<Vec<ObjectImage>, ParticipantError> {
        let committed = self.committed.lock();
        Ok(reads
            .iter()
            .filter_map(|read| {
                committed
                    .get(&read.onum)
                    .filter(|image| image.version > read.version)
                    .cloned()
            })
            .collect())
    }

    fn send_extensions(&self, _onums: &[u64]) -> Result<(), ParticipantError> {
        Ok(())
    }
}
