use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::data_store::object::Oid;
use crate::log::Log;
use crate::tid::TransactionId;

/// A log holding a read lock.
#[derive(Clone)]
pub(crate) struct Reader {
    pub(crate) log: Weak<Log>,
    pub(crate) tid: TransactionId,
}

struct EntryState {
    /// Read-lock holders, keyed by log id.
    readers: HashMap<u64, Reader>,
    version: u64,
    /// Warranty expiry (ms since the epoch) of the cached version.
    expiry: u64,
}

/// Read-lock set and version metadata for one object.
pub struct ReadEntry {
    oid: Oid,
    state: Mutex<EntryState>,
}

impl ReadEntry {
    fn new(oid: Oid, version: u64) -> Self {
        Self {
            oid,
            state: Mutex::new(EntryState {
                readers: HashMap::new(),
                version,
                expiry: 0,
            }),
        }
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub(crate) fn set_version(&self, version: u64) {
        self.state.lock().version = version;
    }

    pub(crate) fn increment_version(&self) -> u64 {
        let mut state = self.state.lock();
        state.version += 1;
        state.version
    }

    pub fn expiry(&self) -> u64 {
        self.state.lock().expiry
    }

    pub(crate) fn extend_expiry(&self, expiry: u64) {
        let mut state = self.state.lock();
        if expiry > state.expiry {
            state.expiry = expiry;
        }
    }

    /// Adds `log` to the reader set. Returns `true` if it was not already there.
    pub(crate) fn add_lock(&self, log: &Arc<Log>) -> bool {
        let mut state = self.state.lock();
        if state.readers.contains_key(&log.id()) {
            return false;
        }
        state.readers.insert(
            log.id(),
            Reader {
                log: Arc::downgrade(log),
                tid: log.tid().clone(),
            },
        );
        true
    }

    pub(crate) fn release_lock(&self, log_id: u64) {
        self.state.lock().readers.remove(&log_id);
    }

    /// Moves `child`'s read lock to `parent`. Returns `true` if `parent` did not
    /// hold the lock before.
    pub(crate) fn transfer_lock(&self, child_id: u64, parent: &Arc<Log>) -> bool {
        let mut state = self.state.lock();
        state.readers.remove(&child_id);
        if state.readers.contains_key(&parent.id()) {
            return false;
        }
        state.readers.insert(
            parent.id(),
            Reader {
                log: Arc::downgrade(parent),
                tid: parent.tid().clone(),
            },
        );
        true
    }

    /// Whether some proper ancestor of `tid` is in the reader set.
    pub(crate) fn held_by_ancestor_of(&self, tid: &TransactionId) -> bool {
        self.state
            .lock()
            .readers
            .values()
            .any(|reader| reader.tid != *tid && tid.is_descendant_of(&reader.tid))
    }

    /// Live readers that are not ancestors of `tid`. Readers whose log is gone
    /// are dropped from the set on the way.
    pub(crate) fn conflicting_readers(&self, tid: &TransactionId) -> Vec<Arc<Log>> {
        let mut state = self.state.lock();
        state.readers.retain(|_, reader| reader.log.strong_count() > 0);
        state
            .readers
            .values()
            .filter(|reader| !tid.is_descendant_of(&reader.tid))
            .filter_map(|reader| reader.log.upgrade())
            .collect()
    }

    pub(crate) fn reader_tids(&self) -> Vec<TransactionId> {
        self.state
            .lock()
            .readers
            .values()
            .map(|reader| reader.tid.clone())
            .collect()
    }
}

/// Process-wide table from object identity to its [`ReadEntry`].
///
/// Entries are owned by the cached objects; the table only keeps weak
/// references and sweeps dead ones periodically.
pub struct ReadMap {
    entries: RwLock<HashMap<Oid, Weak<ReadEntry>>>,
    cleanup_counter: AtomicU64,
    cleanup_threshold: u64,
}

impl Default for ReadMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadMap {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cleanup_counter: AtomicU64::new(0),
            cleanup_threshold: 1000,
        }
    }

    /// Returns the live entry for `oid`, creating it at `version` if needed.
    pub fn get_or_insert(&self, oid: &Oid, version: u64) -> Arc<ReadEntry> {
        if let Some(entry) = self.get(oid) {
            return entry;
        }
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(oid).and_then(Weak::upgrade) {
            return entry;
        }
        let entry = Arc::new(ReadEntry::new(oid.clone(), version));
        entries.insert(oid.clone(), Arc::downgrade(&entry));
        drop(entries);
        self.maybe_trigger_cleanup();
        entry
    }

    pub fn get(&self, oid: &Oid) -> Option<Arc<ReadEntry>> {
        self.entries.read().get(oid).and_then(Weak::upgrade)
    }

    fn maybe_trigger_cleanup(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count >= self.cleanup_threshold {
            self.cleanup_counter.store(0, Ordering::Relaxed);
            let mut entries = self.entries.write();
            let initial = entries.len();
            entries.retain(|_, entry| entry.strong_count() > 0);
            let removed = initial - entries.len();
            if removed > 0 {
                debug!("Swept {} dead read-map entries", removed);
            }
        }
    }
}
