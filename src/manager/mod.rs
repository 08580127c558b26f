//! The per-thread entry point for transactional work.
//!
//! A [`TransactionManager`] tracks the chain of logs the calling thread is
//! currently running, acquires locks on behalf of the innermost one and drives
//! nested and distributed commit and abort.

use log::{debug, warn};
use std::sync::Arc;

mod commit;
pub mod fanout;
mod lock_wait;
pub mod retry;

pub use fanout::FailureMap;
pub use retry::Backoff;

use crate::covenant::Covenant;
use crate::data_store::object::{DistObject, Oid};
use crate::errors::{CovenantError, Result};
use crate::log::{Log, RetryCause};
use crate::tid::TransactionId;
use crate::twopc::Participant;

use self::lock_wait::LockMode;

/// Thread-owned handle on the transaction chain of one thread.
///
/// Managers are not shared between threads; each thread asks the shared
/// [`Covenant`] for its own. Dropping a manager aborts whatever it still has
/// open.
pub struct TransactionManager {
    covenant: Arc<Covenant>,
    current: Option<Arc<Log>>,
}

impl TransactionManager {
    pub(crate) fn new(covenant: Arc<Covenant>) -> Self {
        Self {
            covenant,
            current: None,
        }
    }

    pub fn covenant(&self) -> &Arc<Covenant> {
        &self.covenant
    }

    /// The innermost active log.
    pub fn current_log(&self) -> Option<&Arc<Log>> {
        self.current.as_ref()
    }

    pub fn current_tid(&self) -> Option<TransactionId> {
        self.current.as_ref().map(|log| log.tid().clone())
    }

    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Starts a new transaction, nested inside the current one if there is one.
    ///
    /// # Returns
    ///
    /// The id of the new transaction, or `TransactionRestarting` if the current
    /// transaction has a pending retry signal.
    pub fn start_transaction(&mut self) -> Result<TransactionId> {
        let tid = match &self.current {
            Some(parent) => parent.tid().child(),
            None => TransactionId::new_top_level(),
        };
        self.start_transaction_with_id(tid, false)
    }

    /// Starts a transaction with a given id, typically one received from
    /// another worker that delegated sub-work to this one.
    ///
    /// # Arguments
    ///
    /// * `tid` - Id of the new transaction. With a transaction already active it
    ///   must descend from the current id.
    /// * `ignore_retry_signal` - Start even if the current transaction has been
    ///   told to retry. Used when resuming a transaction whose signal is being
    ///   handled elsewhere.
    pub fn start_transaction_with_id(
        &mut self,
        tid: TransactionId,
        ignore_retry_signal: bool,
    ) -> Result<TransactionId> {
        if !ignore_retry_signal {
            self.check_retry_signal()?;
        }
        let log = match &self.current {
            Some(parent) => {
                if tid == *parent.tid() || !tid.is_descendant_of(parent.tid()) {
                    return Err(CovenantError::Internal(format!(
                        "{:?} cannot be nested inside {:?}",
                        tid,
                        parent.tid()
                    )));
                }
                Log::new_child(parent, tid)
            }
            None => {
                let log = Log::new_top_level(tid);
                self.covenant.register_transaction(&log);
                log
            }
        };
        debug!("Started transaction {}", log.tid());
        let tid = log.tid().clone();
        self.current = Some(log);
        Ok(tid)
    }

    fn require_current(&self) -> Result<Arc<Log>> {
        self.current
            .clone()
            .ok_or(CovenantError::NoActiveTransaction)
    }

    /// Fails with `TransactionRestarting` if the current chain has been told to
    /// retry. The chain is aborted up to and including the flagged level first.
    pub fn check_retry_signal(&mut self) -> Result<()> {
        let Some(signal) = self.current.as_ref().and_then(|log| log.retry_signal()) else {
            return Ok(());
        };
        debug!(
            "Transaction {} observed retry signal for {} ({:?})",
            self.current_tid().map(|tid| tid.to_string()).unwrap_or_default(),
            signal.tid,
            signal.cause
        );
        if let Some(log) = &self.current {
            log.stats().record_retry();
        }
        self.abort_through(&signal.tid)?;
        Err(CovenantError::TransactionRestarting { tid: signal.tid })
    }

    /// Registers a read of `obj`, blocking while another transaction holds its
    /// write lock. Reads outside any transaction take no lock.
    pub fn register_read(&mut self, obj: &DistObject) -> Result<()> {
        let Some(log) = self.current.clone() else {
            return Ok(());
        };
        let result = self.acquire_read(&log, obj);
        self.on_lock_error(result)
    }

    fn acquire_read(&self, log: &Arc<Log>, obj: &DistObject) -> Result<()> {
        let mut record = obj.lock();
        if record.reader.as_ref() == Some(log.tid()) {
            return Ok(());
        }
        self.await_lock(log, obj, &mut record, LockMode::Read)?;
        log.record_read(obj);
        record.reader = Some(log.tid().clone());
        drop(record);

        if let Some(owner) = log.writer_owner(obj.oid()) {
            if owner != self.covenant.config().worker_name {
                self.fetch_from_owner(log, obj, &owner)?;
            }
        }
        Ok(())
    }

    fn fetch_from_owner(&self, log: &Arc<Log>, obj: &DistObject, owner: &str) -> Result<()> {
        let worker = self
            .covenant
            .worker(owner)
            .ok_or_else(|| CovenantError::Internal(format!("unknown worker {}", owner)))?;
        let image = worker.read_object(log.tid(), obj.oid()).map_err(|e| {
            warn!("Reading {} from {} failed: {}", obj.oid(), owner, e);
            CovenantError::LockConflict {
                oid: obj.oid().clone(),
            }
        })?;
        let mut record = obj.lock();
        record.payload = image.payload;
        obj.read_entry().set_version(image.version);
        drop(record);
        log.note_worker_called(owner);
        Ok(())
    }

    /// Registers a write of `obj`. Non-ancestor readers are told to retry;
    /// a non-ancestor writer is waited for.
    ///
    /// # Returns
    ///
    /// `true` if no transaction was active and one was started for this write;
    /// the caller is then expected to commit it.
    pub fn register_write(&mut self, obj: &DistObject) -> Result<bool> {
        let started = if self.current.is_none() {
            self.start_transaction()?;
            true
        } else {
            false
        };
        let log = self.require_current()?;
        let result = self.acquire_write(&log, obj);
        if let Err(e) = result {
            if started && self.current.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &log)) {
                self.abort_transaction()?;
            }
            return self.on_lock_error::<()>(Err(e)).map(|()| started);
        }
        Ok(started)
    }

    fn acquire_write(&self, log: &Arc<Log>, obj: &DistObject) -> Result<()> {
        if obj.lock().writer.as_ref() == Some(log.tid()) {
            return Ok(());
        }
        // Ownership moves before anything is stamped, so a refusal leaves the
        // object untouched and the next attempt asks again.
        self.take_ownership(log, obj)?;
        let mut record = obj.lock();
        if record.writer.as_ref() == Some(log.tid()) {
            return Ok(());
        }
        self.await_lock(log, obj, &mut record, LockMode::Write)?;
        let first = log.record_write(obj, &mut record);
        drop(record);
        if first {
            self.covenant.notify_first_write(log.tid(), obj.oid());
        }
        Ok(())
    }

    fn take_ownership(&self, log: &Arc<Log>, obj: &DistObject) -> Result<()> {
        let own_name = self.covenant.config().worker_name.clone();
        let Some(owner) = log.writer_owner(obj.oid()) else {
            return Ok(());
        };
        if owner == own_name {
            return Ok(());
        }
        let worker = self
            .covenant
            .worker(&owner)
            .ok_or_else(|| CovenantError::Internal(format!("unknown worker {}", owner)))?;
        match worker.take_ownership(log.tid(), obj.oid()) {
            Ok(()) => {
                log.record_owner(obj.oid().clone(), &own_name);
                log.note_worker_called(&owner);
                debug!("Took ownership of {} from {}", obj.oid(), owner);
                Ok(())
            }
            Err(e) => {
                warn!("{} refused to hand over {}: {}", owner, obj.oid(), e);
                Err(CovenantError::LockConflict {
                    oid: obj.oid().clone(),
                })
            }
        }
    }

    /// A restart raised from inside a lock wait has to abort the chain like any
    /// other observed retry signal.
    fn on_lock_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(CovenantError::TransactionRestarting { tid }) = &result {
            let still_open = self
                .current
                .as_ref()
                .is_some_and(|log| log.tid().is_descendant_of(tid));
            if still_open {
                self.abort_through(tid)?;
            }
        }
        result
    }

    /// Registers a freshly created object. Creation never blocks.
    pub fn register_create(&mut self, obj: &DistObject) -> Result<()> {
        let log = self.require_current()?;
        let mut record = obj.lock();
        log.record_create(obj, &mut record);
        Ok(())
    }

    /// Records that `worker` currently owns `oid`.
    pub fn record_remote_owner(&mut self, oid: &Oid, worker: &str) -> Result<()> {
        let log = self.require_current()?;
        if worker == self.covenant.config().worker_name {
            log.clear_owner(oid);
        } else {
            log.record_owner(oid.clone(), worker);
        }
        Ok(())
    }

    /// Records that part of the current transaction ran on `worker`, which then
    /// takes part in its commit.
    pub fn register_remote_call(&mut self, worker: &str) -> Result<()> {
        let log = self.require_current()?;
        log.note_worker_called(worker);
        Ok(())
    }

    /// Records that writing `trigger` obliges the transaction to extend the
    /// warranty on `obj` once it commits.
    pub fn register_extension_trigger(&mut self, obj: &DistObject, trigger: &Oid) -> Result<()> {
        self.require_current()?.register_extension_trigger(obj, trigger);
        Ok(())
    }

    pub fn register_treaty_extension(&mut self, oid: &Oid) -> Result<()> {
        self.require_current()?.register_treaty_extension(oid);
        Ok(())
    }

    /// Asks for `obj`'s warranty to be extended after commit.
    pub fn request_warranty_extension(&mut self, obj: &DistObject) -> Result<()> {
        self.require_current()?.request_extension(obj);
        Ok(())
    }

    pub fn acquire_pessimistic_lock(&mut self, oid: &Oid) -> Result<()> {
        self.require_current()?.acquire_lock_intent(oid);
        Ok(())
    }

    pub fn release_pessimistic_lock(&mut self, oid: &Oid) -> Result<()> {
        self.require_current()?.release_lock_intent(oid);
        Ok(())
    }

    pub fn create_pessimistic_lock(&mut self, oid: &Oid) -> Result<()> {
        self.require_current()?.create_lock_intent(oid);
        Ok(())
    }

    /// Whether information labelled `from` may flow to `to`. Decisions are
    /// cached in the current transaction and, once it commits, worker-wide.
    pub fn check_label_flow(&mut self, from: &str, to: &str, decide: impl FnOnce() -> bool) -> bool {
        if let Some(log) = &self.current {
            if let Some(allowed) = log.label_flow(from, to) {
                return allowed;
            }
        }
        if let Some(allowed) = self.covenant.label_flow(from, to) {
            return allowed;
        }
        let allowed = decide();
        match &self.current {
            Some(log) => log.record_label_flow(from, to, allowed),
            None => self.covenant.record_label_flow(from, to, allowed),
        }
        allowed
    }

    /// Aborts the innermost transaction.
    pub fn abort_transaction(&mut self) -> Result<()> {
        self.abort_transaction_excluding(&[])
    }

    /// Aborts the innermost transaction. For a top-level transaction, abort
    /// messages go to every prepared participant and called worker except those
    /// in `excluded`.
    pub fn abort_transaction_excluding(&mut self, excluded: &[Participant]) -> Result<()> {
        let log = self.require_current()?;
        if let Some(child) = log.child() {
            child.flag_retry(RetryCause::Requested)?;
        }
        if log.is_top_level() {
            self.abort_top_level(&log, excluded);
        } else {
            log.abort();
            self.current = log.parent().cloned();
        }
        Ok(())
    }

    /// Aborts every open level from the innermost up to and including `tid`.
    /// Levels above `tid` stay open.
    pub fn abort_through(&mut self, tid: &TransactionId) -> Result<()> {
        while let Some(log) = self.current.clone() {
            if !log.tid().is_descendant_of(tid) {
                break;
            }
            self.abort_transaction()?;
        }
        Ok(())
    }

    /// Whether a log with `tid` is still open on this manager's chain.
    pub(crate) fn is_open(&self, tid: &TransactionId) -> bool {
        let mut cursor = self.current.clone();
        while let Some(log) = cursor {
            if log.tid() == tid {
                return true;
            }
            cursor = log.parent().cloned();
        }
        false
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        while let Some(log) = self.current.clone() {
            warn!("Aborting {} left open at manager drop", log.tid());
            if self.abort_transaction().is_err() {
                break;
            }
        }
    }
}
