//! Per-(sub)transaction logs.
//!
//! A [`Log`] records everything one level of a nested transaction did: the read
//! and write locks it holds, the objects it created, the workers it called and
//! the warranty extensions it owes. Logs form a chain from the top-level
//! transaction down to the innermost active sub-transaction; a nested commit
//! folds a log into its parent, an abort undoes it.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub mod commit_state;
pub mod label_cache;
pub mod writer_map;

pub use commit_state::{CommitPhase, CommitState};
pub use label_cache::LabelCache;
pub use writer_map::WriterMap;

use crate::data_store::object::{DistObject, LockHolder, ObjectCell, ObjectRecord, Oid};
use crate::data_store::read_map::ReadEntry;
use crate::errors::{CovenantError, Result};
use crate::stats::TxnStats;
use crate::tid::TransactionId;
use crate::twopc::{PrepareWritesRequest, ReadVersion};

static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// Why a transaction was told to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    /// Chosen as the victim of a deadlock cycle.
    Deadlock,
    /// A writer needed a read lock this transaction held.
    ReadLockRevoked { by: TransactionId },
    /// Requested explicitly, e.g. by a remote worker.
    Requested,
}

/// A pending request for the transaction `tid` to restart.
#[derive(Debug, Clone)]
pub struct RetrySignal {
    pub tid: TransactionId,
    pub cause: RetryCause,
}

#[derive(Default)]
struct WaitState {
    waits_on: Option<Weak<ObjectCell>>,
    waits_for: Vec<Weak<Log>>,
}

/// Mutable bookkeeping of a log. Only the thread running the log touches it,
/// except for the short reads done by the deadlock detector through
/// [`Log::waits_for`].
pub(crate) struct LogState {
    pub(crate) reads: Vec<Arc<ReadEntry>>,
    /// Entries whose read lock some ancestor also holds.
    pub(crate) reads_read_by_parent: Vec<Arc<ReadEntry>>,
    /// Objects read, so that writers blocked on them can be woken on release.
    pub(crate) read_objects: Vec<Weak<ObjectCell>>,
    pub(crate) creates: Vec<DistObject>,
    pub(crate) local_store_creates: Vec<Weak<ObjectCell>>,
    pub(crate) writes: Vec<DistObject>,
    pub(crate) local_store_writes: Vec<Weak<ObjectCell>>,
    pub(crate) writer_map: WriterMap,
    pub(crate) workers_called: HashSet<String>,
    pub(crate) labels: LabelCache,
    pub(crate) extended_treaties: HashSet<Oid>,
    pub(crate) delayed_extensions: HashMap<Oid, DistObject>,
    /// Object to the triggers whose write requires extending it.
    pub(crate) extension_triggers: HashMap<Oid, HashSet<Oid>>,
    /// Reverse of `extension_triggers`.
    pub(crate) triggered_by: HashMap<Oid, Vec<DistObject>>,
    pub(crate) acquires: HashSet<Oid>,
    pub(crate) pending_releases: HashSet<Oid>,
    pub(crate) locks_created: HashSet<Oid>,
    /// Earliest warranty expiry among the objects read.
    pub(crate) expiry: u64,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            reads: Vec::new(),
            reads_read_by_parent: Vec::new(),
            read_objects: Vec::new(),
            creates: Vec::new(),
            local_store_creates: Vec::new(),
            writes: Vec::new(),
            local_store_writes: Vec::new(),
            writer_map: WriterMap::new(),
            workers_called: HashSet::new(),
            labels: LabelCache::new(),
            extended_treaties: HashSet::new(),
            delayed_extensions: HashMap::new(),
            extension_triggers: HashMap::new(),
            triggered_by: HashMap::new(),
            acquires: HashSet::new(),
            pending_releases: HashSet::new(),
            locks_created: HashSet::new(),
            expiry: u64::MAX,
        }
    }
}

fn upgrade_all(cells: &[Weak<ObjectCell>]) -> impl Iterator<Item = DistObject> + '_ {
    cells
        .iter()
        .filter_map(Weak::upgrade)
        .map(DistObject::from_cell)
}

/// Wakes every thread parked on one of `cells`. The monitor is taken briefly so
/// a waiter between its condition check and its wait cannot miss the wakeup.
fn wake_all(cells: &[Weak<ObjectCell>]) {
    for obj in upgrade_all(cells) {
        drop(obj.lock());
        obj.monitor().notify_all();
    }
}

fn holds_cell(cells: &[Weak<ObjectCell>], obj: &DistObject) -> bool {
    let target = Arc::as_ptr(obj.cell());
    cells.iter().any(|cell| std::ptr::eq(cell.as_ptr(), target))
}

impl LogState {
    pub(crate) fn written(&self) -> Vec<DistObject> {
        let mut objects = self.writes.clone();
        objects.extend(upgrade_all(&self.local_store_writes));
        objects
    }

    pub(crate) fn created(&self) -> Vec<DistObject> {
        let mut objects = self.creates.clone();
        objects.extend(upgrade_all(&self.local_store_creates));
        objects
    }

    fn has_written(&self, obj: &DistObject) -> bool {
        if obj.is_local() {
            holds_cell(&self.local_store_writes, obj)
        } else {
            self.writes.iter().any(|w| w.ptr_eq(obj))
        }
    }

    fn has_created(&self, obj: &DistObject) -> bool {
        if obj.is_local() {
            holds_cell(&self.local_store_creates, obj)
        } else {
            self.creates.iter().any(|c| c.ptr_eq(obj))
        }
    }

    fn push_write(&mut self, obj: &DistObject) {
        if self.has_written(obj) {
            return;
        }
        if obj.is_local() {
            self.local_store_writes.push(obj.downgrade());
        } else {
            self.writes.push(obj.clone());
        }
    }

    fn push_create(&mut self, obj: &DistObject) {
        if self.has_created(obj) {
            return;
        }
        if obj.is_local() {
            self.local_store_creates.push(obj.downgrade());
        } else {
            self.creates.push(obj.clone());
        }
    }

    fn touched_oids(&self) -> HashSet<Oid> {
        self.written()
            .iter()
            .chain(self.created().iter())
            .map(|obj| obj.oid().clone())
            .collect()
    }
}

/// What a finished top-level commit leaves behind for the manager.
pub(crate) struct TopLevelOutcome {
    pub(crate) labels: LabelCache,
    /// Delayed warranty extensions to send, per store.
    pub(crate) extensions: HashMap<String, Vec<u64>>,
}

/// The log of one (sub)transaction.
pub struct Log {
    id: u64,
    tid: TransactionId,
    parent: Option<Arc<Log>>,
    child: Mutex<Option<Weak<Log>>>,
    commit_state: Arc<CommitState>,
    stats: Arc<TxnStats>,
    retry: Mutex<Option<RetrySignal>>,
    wait: Mutex<WaitState>,
    pub(crate) state: Mutex<LogState>,
}

impl Log {
    pub(crate) fn new_top_level(tid: TransactionId) -> Arc<Log> {
        Arc::new(Log {
            id: NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed),
            tid,
            parent: None,
            child: Mutex::new(None),
            commit_state: Arc::new(CommitState::new()),
            stats: Arc::new(TxnStats::new()),
            retry: Mutex::new(None),
            wait: Mutex::new(WaitState::default()),
            state: Mutex::new(LogState::default()),
        })
    }

    /// Opens a sub-transaction of `parent`. The child starts from copies of the
    /// parent's writer map and label cache and inherits any retry signal that
    /// is pending on the parent.
    pub(crate) fn new_child(parent: &Arc<Log>, tid: TransactionId) -> Arc<Log> {
        let (writer_map, labels) = {
            let state = parent.state.lock();
            (state.writer_map.clone(), state.labels.clone())
        };
        let child = Arc::new(Log {
            id: NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed),
            tid,
            parent: Some(parent.clone()),
            child: Mutex::new(None),
            commit_state: parent.commit_state.clone(),
            stats: parent.stats.clone(),
            retry: Mutex::new(parent.retry.lock().clone()),
            wait: Mutex::new(WaitState::default()),
            state: Mutex::new(LogState {
                writer_map,
                labels,
                ..LogState::default()
            }),
        });
        *parent.child.lock() = Some(Arc::downgrade(&child));
        child
    }

    /// Process-unique identity of this log.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tid(&self) -> &TransactionId {
        &self.tid
    }

    pub fn parent(&self) -> Option<&Arc<Log>> {
        self.parent.as_ref()
    }

    /// The currently active sub-transaction, if any.
    pub fn child(&self) -> Option<Arc<Log>> {
        self.child.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    pub fn commit_state(&self) -> &Arc<CommitState> {
        &self.commit_state
    }

    pub fn stats(&self) -> &Arc<TxnStats> {
        &self.stats
    }

    /// Follows the child links down to the innermost active log.
    pub fn innermost(self: &Arc<Self>) -> Arc<Log> {
        let mut current = self.clone();
        while let Some(child) = current.child() {
            current = child;
        }
        current
    }

    pub fn retry_signal(&self) -> Option<RetrySignal> {
        self.retry.lock().clone()
    }

    /// Asks this transaction, and therefore all of its sub-transactions, to
    /// restart. A thread blocked on a lock on behalf of any of them wakes up.
    pub(crate) fn flag_retry(self: &Arc<Self>, cause: RetryCause) -> Result<()> {
        let target = self.tid.clone();
        let mut cursor = Some(self.clone());
        while let Some(log) = cursor {
            log.apply_signal(&target, &cause)?;
            log.wake();
            cursor = log.child();
        }
        debug!("Flagged {} for retry ({:?})", target, cause);
        Ok(())
    }

    fn apply_signal(&self, target: &TransactionId, cause: &RetryCause) -> Result<()> {
        let mut retry = self.retry.lock();
        match retry.as_ref() {
            None => {}
            Some(existing) if existing.tid == *target => return Ok(()),
            // The outermost restart wins.
            Some(existing) if target.is_descendant_of(&existing.tid) => return Ok(()),
            Some(existing) if existing.tid.is_descendant_of(target) => {}
            Some(existing) => {
                return Err(CovenantError::Internal(format!(
                    "unrelated retry signals {} and {} on log {}",
                    existing.tid, target, self.tid
                )));
            }
        }
        *retry = Some(RetrySignal {
            tid: target.clone(),
            cause: cause.clone(),
        });
        Ok(())
    }

    pub(crate) fn clear_retry_signal(&self) {
        *self.retry.lock() = None;
    }

    fn wake(&self) {
        let waits_on = self.wait.lock().waits_on.as_ref().and_then(Weak::upgrade);
        if let Some(cell) = waits_on {
            cell.notify_all();
        }
    }

    pub(crate) fn set_waiting(&self, on: &DistObject, holders: Vec<Weak<Log>>) {
        let mut wait = self.wait.lock();
        wait.waits_on = Some(on.downgrade());
        wait.waits_for = holders;
    }

    pub(crate) fn clear_waiting(&self) {
        let mut wait = self.wait.lock();
        wait.waits_on = None;
        wait.waits_for.clear();
    }

    /// Logs this one is currently blocked behind.
    pub fn waits_for(&self) -> Vec<Arc<Log>> {
        self.wait
            .lock()
            .waits_for
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn is_waiting(&self) -> bool {
        self.wait.lock().waits_on.is_some()
    }

    /// Earliest warranty expiry among the objects read so far, `u64::MAX` if
    /// none carried a warranty.
    pub fn expiry(&self) -> u64 {
        self.state.lock().expiry
    }

    pub fn read_count(&self) -> usize {
        let state = self.state.lock();
        state.reads.len() + state.reads_read_by_parent.len()
    }

    pub fn write_count(&self) -> usize {
        let state = self.state.lock();
        state.writes.len() + upgrade_all(&state.local_store_writes).count()
    }

    pub fn create_count(&self) -> usize {
        let state = self.state.lock();
        state.creates.len() + upgrade_all(&state.local_store_creates).count()
    }

    pub fn writes(&self) -> Vec<DistObject> {
        self.state.lock().written()
    }

    pub fn creates(&self) -> Vec<DistObject> {
        self.state.lock().created()
    }

    pub fn workers_called(&self) -> Vec<String> {
        let mut workers: Vec<String> = self.state.lock().workers_called.iter().cloned().collect();
        workers.sort();
        workers
    }

    pub(crate) fn note_worker_called(&self, worker: &str) {
        self.state.lock().workers_called.insert(worker.to_string());
    }

    pub fn writer_owner(&self, oid: &Oid) -> Option<String> {
        self.state.lock().writer_map.lookup(oid).map(str::to_string)
    }

    pub(crate) fn record_owner(&self, oid: Oid, worker: &str) {
        self.state.lock().writer_map.put(oid, worker);
    }

    pub(crate) fn clear_owner(&self, oid: &Oid) {
        self.state.lock().writer_map.remove(oid);
    }

    pub fn label_flow(&self, from: &str, to: &str) -> Option<bool> {
        self.state.lock().labels.lookup(from, to)
    }

    pub(crate) fn record_label_flow(&self, from: &str, to: &str, allowed: bool) {
        self.state.lock().labels.record(from, to, allowed);
    }

    /// Records that a write to `trigger` requires extending `obj`'s warranty.
    pub(crate) fn register_extension_trigger(&self, obj: &DistObject, trigger: &Oid) {
        let mut state = self.state.lock();
        state
            .extension_triggers
            .entry(obj.oid().clone())
            .or_default()
            .insert(trigger.clone());
        let dependents = state.triggered_by.entry(trigger.clone()).or_default();
        if !dependents.iter().any(|d| d.ptr_eq(obj)) {
            dependents.push(obj.clone());
        }
    }

    pub(crate) fn register_treaty_extension(&self, oid: &Oid) {
        self.state.lock().extended_treaties.insert(oid.clone());
    }

    pub(crate) fn request_extension(&self, obj: &DistObject) {
        self.state
            .lock()
            .delayed_extensions
            .entry(obj.oid().clone())
            .or_insert_with(|| obj.clone());
    }

    pub fn delayed_extensions(&self) -> Vec<Oid> {
        let mut oids: Vec<Oid> = self.state.lock().delayed_extensions.keys().cloned().collect();
        oids.sort();
        oids
    }

    pub fn extended_treaties(&self) -> Vec<Oid> {
        let mut oids: Vec<Oid> = self.state.lock().extended_treaties.iter().cloned().collect();
        oids.sort();
        oids
    }

    pub(crate) fn acquire_lock_intent(&self, oid: &Oid) {
        let mut state = self.state.lock();
        state.pending_releases.remove(oid);
        state.acquires.insert(oid.clone());
    }

    pub(crate) fn release_lock_intent(&self, oid: &Oid) {
        let mut state = self.state.lock();
        if !state.acquires.remove(oid) {
            state.pending_releases.insert(oid.clone());
        }
    }

    pub(crate) fn create_lock_intent(&self, oid: &Oid) {
        self.state.lock().locks_created.insert(oid.clone());
    }

    /// Adds this log to `obj`'s readers. The caller holds the object's monitor
    /// and has established the read condition.
    pub(crate) fn record_read(self: &Arc<Self>, obj: &DistObject) {
        let entry = obj.read_entry();
        if !entry.add_lock(self) {
            return;
        }
        let by_ancestor = self.parent.is_some() && entry.held_by_ancestor_of(&self.tid);
        let expiry = entry.expiry();
        let mut state = self.state.lock();
        state.read_objects.push(obj.downgrade());
        if by_ancestor {
            state.reads_read_by_parent.push(entry.clone());
        } else {
            state.reads.push(entry.clone());
        }
        if expiry > 0 {
            state.expiry = state.expiry.min(expiry);
        }
    }

    /// Takes `obj`'s write lock. The caller holds the object's monitor and has
    /// established the write condition. Returns `true` on the first acquisition
    /// by this log, when an undo layer was pushed.
    pub(crate) fn record_write(
        self: &Arc<Self>,
        obj: &DistObject,
        record: &mut ObjectRecord,
    ) -> bool {
        if record
            .holder
            .as_ref()
            .is_some_and(|holder| holder.log_id == self.id)
        {
            record.writer = Some(self.tid.clone());
            record.reader = Some(self.tid.clone());
            return false;
        }
        record.push_history();
        record.holder = Some(LockHolder::of(self));
        record.writer = Some(self.tid.clone());
        record.reader = Some(self.tid.clone());
        record.is_owned = true;

        let mut state = self.state.lock();
        state.push_write(obj);
        if let Some(dependents) = state.triggered_by.get(obj.oid()).cloned() {
            for dependent in dependents {
                state
                    .delayed_extensions
                    .entry(dependent.oid().clone())
                    .or_insert(dependent);
            }
        }
        true
    }

    /// Marks `obj` as created by this log. The caller holds the object's monitor.
    pub(crate) fn record_create(self: &Arc<Self>, obj: &DistObject, record: &mut ObjectRecord) {
        record.holder = Some(LockHolder::of(self));
        record.writer = Some(self.tid.clone());
        record.reader = Some(self.tid.clone());
        record.is_owned = true;
        self.state.lock().push_create(obj);
    }

    /// Folds this sub-transaction into its parent.
    pub(crate) fn commit_nested(self: &Arc<Self>) -> Result<()> {
        let Some(parent) = self.parent.clone() else {
            return Err(CovenantError::Internal(format!(
                "nested commit of top-level transaction {}",
                self.tid
            )));
        };
        self.clear_waiting();
        let state = std::mem::take(&mut *self.state.lock());

        let mut new_reads = Vec::new();
        let mut new_reads_by_ancestor = Vec::new();
        for entry in state.reads.iter().chain(state.reads_read_by_parent.iter()) {
            if entry.transfer_lock(self.id, &parent) {
                if parent.parent.is_some() && entry.held_by_ancestor_of(&parent.tid) {
                    new_reads_by_ancestor.push(entry.clone());
                } else {
                    new_reads.push(entry.clone());
                }
            }
        }

        let mut moved_writes = Vec::new();
        for obj in state.written() {
            let mut record = obj.lock();
            let parent_held = record
                .top_history()
                .and_then(|layer| layer.holder())
                .is_some_and(|holder| holder.log_id == parent.id);
            if parent_held {
                record.discard_history_layer();
            } else {
                moved_writes.push(obj.clone());
            }
            record.holder = Some(LockHolder::of(&parent));
            record.writer = Some(parent.tid.clone());
            record.reader = None;
            drop(record);
            obj.monitor().notify_all();
        }

        let created = state.created();
        for obj in &created {
            let mut record = obj.lock();
            record.holder = Some(LockHolder::of(&parent));
            record.writer = Some(parent.tid.clone());
            record.reader = None;
            drop(record);
            obj.monitor().notify_all();
        }

        let mut parent_state = parent.state.lock();
        parent_state.reads.extend(new_reads);
        parent_state.reads_read_by_parent.extend(new_reads_by_ancestor);
        parent_state.read_objects.extend(state.read_objects);
        for obj in &moved_writes {
            parent_state.push_write(obj);
        }
        for obj in &created {
            parent_state.push_create(obj);
        }
        parent_state.labels.merge(state.labels);
        parent_state.writer_map.merge_from(state.writer_map);
        parent_state.workers_called.extend(state.workers_called);
        parent_state.acquires.extend(state.acquires);
        parent_state.pending_releases.extend(state.pending_releases);
        parent_state.locks_created.extend(state.locks_created);
        parent_state.extended_treaties.extend(state.extended_treaties);

        let parent_touched = parent_state.touched_oids();
        for (oid, obj) in state.delayed_extensions {
            if !parent_touched.contains(&oid) {
                parent_state.delayed_extensions.entry(oid).or_insert(obj);
            }
        }
        for (oid, triggers) in state.extension_triggers {
            parent_state
                .extension_triggers
                .entry(oid)
                .or_default()
                .extend(triggers);
        }
        for (trigger, dependents) in state.triggered_by {
            let merged = parent_state.triggered_by.entry(trigger).or_default();
            for dependent in dependents {
                if !merged.iter().any(|d| d.ptr_eq(&dependent)) {
                    merged.push(dependent);
                }
            }
        }
        parent_state.expiry = parent_state.expiry.min(state.expiry);
        drop(parent_state);

        *parent.child.lock() = None;
        debug!("Committed {} into {}", self.tid, parent.tid);
        Ok(())
    }

    /// Undoes everything this log did and detaches it from its parent.
    pub(crate) fn abort(self: &Arc<Self>) {
        self.clear_waiting();
        let state = std::mem::take(&mut *self.state.lock());

        for entry in state.reads.iter().chain(state.reads_read_by_parent.iter()) {
            entry.release_lock(self.id);
        }
        wake_all(&state.read_objects);

        for obj in state.written() {
            let mut record = obj.lock();
            if record
                .holder
                .as_ref()
                .is_some_and(|holder| holder.log_id == self.id)
            {
                record.rollback();
            }
            drop(record);
            obj.monitor().notify_all();
        }

        for obj in state.created() {
            let mut record = obj.lock();
            if record
                .holder
                .as_ref()
                .is_some_and(|holder| holder.log_id == self.id)
            {
                record.holder = None;
                record.writer = None;
                record.reader = None;
                record.is_owned = false;
            }
            drop(record);
            obj.monitor().notify_all();
        }

        self.clear_retry_signal();
        if let Some(parent) = &self.parent {
            *parent.child.lock() = None;
        }
        debug!("Aborted {}", self.tid);
    }

    /// Releases every lock after a successful distributed commit and makes the
    /// new versions visible in the cache.
    pub(crate) fn commit_top_level(self: &Arc<Self>) -> TopLevelOutcome {
        self.clear_waiting();
        let state = std::mem::take(&mut *self.state.lock());

        for entry in state.reads.iter().chain(state.reads_read_by_parent.iter()) {
            entry.release_lock(self.id);
        }
        wake_all(&state.read_objects);

        let written = state.written();
        let created = state.created();
        for obj in written.iter().chain(created.iter()) {
            let mut record = obj.lock();
            record.holder = None;
            record.writer = None;
            record.reader = None;
            record.history = None;
            obj.read_entry().increment_version();
            drop(record);
            obj.monitor().notify_all();
        }

        let touched: HashSet<&Oid> = written
            .iter()
            .chain(created.iter())
            .map(DistObject::oid)
            .collect();
        let mut extensions: HashMap<String, Vec<u64>> = HashMap::new();
        for oid in state.delayed_extensions.keys() {
            if !touched.contains(oid) {
                extensions.entry(oid.store.clone()).or_default().push(oid.onum);
            }
        }
        for onums in extensions.values_mut() {
            onums.sort_unstable();
        }

        self.clear_retry_signal();
        TopLevelOutcome {
            labels: state.labels,
            extensions,
        }
    }

    /// Phase-one payload for every store holding an object this transaction
    /// created or wrote, or a lock intent.
    pub(crate) fn writes_by_store(&self) -> HashMap<String, PrepareWritesRequest> {
        let (written, created, acquires, releases, locks_created) = {
            let state = self.state.lock();
            (
                state.written(),
                state.created(),
                state.acquires.iter().cloned().collect::<Vec<_>>(),
                state.pending_releases.iter().cloned().collect::<Vec<_>>(),
                state.locks_created.iter().cloned().collect::<Vec<_>>(),
            )
        };
        let mut by_store: HashMap<String, PrepareWritesRequest> = HashMap::new();
        for obj in created {
            by_store
                .entry(obj.oid().store.clone())
                .or_default()
                .creates
                .push(obj.image());
        }
        for obj in written {
            by_store
                .entry(obj.oid().store.clone())
                .or_default()
                .writes
                .push(obj.image());
        }
        for oid in acquires {
            by_store.entry(oid.store).or_default().locks.acquires.push(oid.onum);
        }
        for oid in releases {
            by_store.entry(oid.store).or_default().locks.releases.push(oid.onum);
        }
        for oid in locks_created {
            by_store.entry(oid.store).or_default().locks.created.push(oid.onum);
        }
        by_store
    }

    /// Read set grouped by store, without the objects this transaction created.
    pub(crate) fn reads_by_store(&self) -> HashMap<String, Vec<ReadVersion>> {
        let (entries, created) = {
            let state = self.state.lock();
            let entries: Vec<Arc<ReadEntry>> = state
                .reads
                .iter()
                .chain(state.reads_read_by_parent.iter())
                .cloned()
                .collect();
            let created: HashSet<Oid> = state
                .created()
                .iter()
                .map(|obj| obj.oid().clone())
                .collect();
            (entries, created)
        };
        let mut by_store: HashMap<String, Vec<ReadVersion>> = HashMap::new();
        for entry in entries {
            if created.contains(entry.oid()) {
                continue;
            }
            by_store
                .entry(entry.oid().store.clone())
                .or_default()
                .push(ReadVersion {
                    onum: entry.oid().onum,
                    version: entry.version(),
                });
        }
        by_store
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("id", &self.id)
            .field("tid", &self.tid)
            .finish()
    }
}
