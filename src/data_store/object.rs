use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::data_store::read_map::ReadEntry;
use crate::errors::Result;
use crate::log::Log;
use crate::manager::TransactionManager;
use crate::tid::TransactionId;

/// Global identity of an object: the store it lives on and its number there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid {
    /// Name of the store holding the object.
    pub store: String,
    /// Object number, unique within the store.
    pub onum: u64,
}

impl Oid {
    pub fn new(store: impl Into<String>, onum: u64) -> Self {
        Self {
            store: store.into(),
            onum,
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store, self.onum)
    }
}

/// Serialized state of an object as shipped to and from stores and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectImage {
    pub oid: Oid,
    pub version: u64,
    pub payload: Vec<u8>,
}

/// The log currently holding an object's write lock.
#[derive(Clone)]
pub(crate) struct LockHolder {
    pub(crate) log: Weak<Log>,
    pub(crate) log_id: u64,
    pub(crate) tid: TransactionId,
}

impl LockHolder {
    pub(crate) fn of(log: &Arc<Log>) -> Self {
        Self {
            log: Arc::downgrade(log),
            log_id: log.id(),
            tid: log.tid().clone(),
        }
    }
}

/// One undo layer: the object's state just before a transaction first wrote it.
pub(crate) struct Snapshot {
    payload: Vec<u8>,
    holder: Option<LockHolder>,
    writer: Option<TransactionId>,
    is_owned: bool,
    history: Option<Box<Snapshot>>,
}

impl Snapshot {
    pub(crate) fn holder(&self) -> Option<&LockHolder> {
        self.holder.as_ref()
    }
}

/// Mutable per-object state, guarded by the object's monitor.
pub(crate) struct ObjectRecord {
    pub(crate) payload: Vec<u8>,
    /// Write-lock holder.
    pub(crate) holder: Option<LockHolder>,
    /// Write stamp: the transaction for which a write needs no further checks.
    pub(crate) writer: Option<TransactionId>,
    /// Read stamp: the transaction for which a read needs no further checks.
    pub(crate) reader: Option<TransactionId>,
    pub(crate) is_owned: bool,
    pub(crate) history: Option<Box<Snapshot>>,
}

impl ObjectRecord {
    /// Pushes the current state as a new undo layer.
    pub(crate) fn push_history(&mut self) {
        let snapshot = Snapshot {
            payload: self.payload.clone(),
            holder: self.holder.clone(),
            writer: self.writer.clone(),
            is_owned: self.is_owned,
            history: self.history.take(),
        };
        self.history = Some(Box::new(snapshot));
    }

    /// Restores the most recent undo layer. Returns `false` if there was none.
    pub(crate) fn rollback(&mut self) -> bool {
        self.reader = None;
        match self.history.take() {
            Some(layer) => {
                let layer = *layer;
                self.payload = layer.payload;
                self.holder = layer.holder;
                self.writer = layer.writer;
                self.is_owned = layer.is_owned;
                self.history = layer.history;
                true
            }
            None => false,
        }
    }

    /// Drops the most recent undo layer, keeping the current state.
    pub(crate) fn discard_history_layer(&mut self) {
        self.history = self.history.take().and_then(|layer| layer.history);
    }

    pub(crate) fn history_depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.history.as_deref();
        while let Some(layer) = cursor {
            depth += 1;
            cursor = layer.history.as_deref();
        }
        depth
    }

    pub(crate) fn top_history(&self) -> Option<&Snapshot> {
        self.history.as_deref()
    }
}

pub(crate) struct ObjectCell {
    oid: Oid,
    local: bool,
    read_entry: Arc<ReadEntry>,
    record: Mutex<ObjectRecord>,
    monitor: Condvar,
}

impl ObjectCell {
    pub(crate) fn notify_all(&self) {
        self.monitor.notify_all();
    }
}

/// Handle to a distributed object cached on this worker.
///
/// Cloning the handle is cheap; every clone refers to the same cached copy and
/// the same monitor.
#[derive(Clone)]
pub struct DistObject(Arc<ObjectCell>);

impl DistObject {
    pub(crate) fn new(
        oid: Oid,
        local: bool,
        payload: Vec<u8>,
        read_entry: Arc<ReadEntry>,
    ) -> Self {
        Self(Arc::new(ObjectCell {
            oid,
            local,
            read_entry,
            record: Mutex::new(ObjectRecord {
                payload,
                holder: None,
                writer: None,
                reader: None,
                is_owned: false,
                history: None,
            }),
            monitor: Condvar::new(),
        }))
    }

    pub(crate) fn from_cell(cell: Arc<ObjectCell>) -> Self {
        Self(cell)
    }

    pub(crate) fn cell(&self) -> &Arc<ObjectCell> {
        &self.0
    }

    pub(crate) fn downgrade(&self) -> Weak<ObjectCell> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ObjectRecord> {
        self.0.record.lock()
    }

    pub(crate) fn monitor(&self) -> &Condvar {
        &self.0.monitor
    }

    pub(crate) fn read_entry(&self) -> &Arc<ReadEntry> {
        &self.0.read_entry
    }

    pub fn oid(&self) -> &Oid {
        &self.0.oid
    }

    /// Whether the object lives on the in-process store.
    pub fn is_local(&self) -> bool {
        self.0.local
    }

    /// Last committed version known to this worker.
    pub fn version(&self) -> u64 {
        self.0.read_entry.version()
    }

    /// Current cached payload, without registering a read.
    pub fn payload(&self) -> Vec<u8> {
        self.lock().payload.clone()
    }

    pub fn write_lock_holder(&self) -> Option<TransactionId> {
        self.lock().holder.as_ref().map(|holder| holder.tid.clone())
    }

    pub fn writer_stamp(&self) -> Option<TransactionId> {
        self.lock().writer.clone()
    }

    pub fn reader_stamp(&self) -> Option<TransactionId> {
        self.lock().reader.clone()
    }

    /// Number of undo layers currently stacked on the object.
    pub fn history_depth(&self) -> usize {
        self.lock().history_depth()
    }

    pub fn is_owned(&self) -> bool {
        self.lock().is_owned
    }

    /// Transactions currently holding a read lock on the object.
    pub fn read_lock_holders(&self) -> Vec<TransactionId> {
        self.0.read_entry.reader_tids()
    }

    /// Reads the payload inside the calling thread's current transaction.
    pub fn get(&self, tm: &mut TransactionManager) -> Result<Vec<u8>> {
        tm.register_read(self)?;
        Ok(self.payload())
    }

    /// Replaces the payload inside the calling thread's current transaction. A
    /// write outside any transaction runs as its own top-level transaction.
    pub fn set(&self, tm: &mut TransactionManager, payload: Vec<u8>) -> Result<()> {
        let started = tm.register_write(self)?;
        self.lock().payload = payload;
        if started {
            tm.commit_transaction()?;
        }
        Ok(())
    }

    pub(crate) fn image(&self) -> ObjectImage {
        ObjectImage {
            oid: self.0.oid.clone(),
            version: self.version(),
            payload: self.payload(),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &DistObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for DistObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistObject")
            .field("oid", &self.0.oid)
            .field("local", &self.0.local)
            .field("version", &self.version())
            .finish()
    }
}
