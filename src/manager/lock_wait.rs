use ahash::AHashSet as HashSet;
use log::{debug, warn};
use parking_lot::MutexGuard;
use std::sync::Arc;

use crate::data_store::object::{DistObject, ObjectRecord};
use crate::errors::{CovenantError, Result};
use crate::log::{Log, RetryCause};
use crate::manager::TransactionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Read,
    Write,
}

impl TransactionManager {
    /// Blocks on `obj`'s monitor until `log` may take the lock in `mode`.
    ///
    /// The first wait is short; later ones use the long poll interval. Every
    /// wait that times out asks the deadlock detector to look at `log`. A retry
    /// signal on `log` ends the wait with `TransactionRestarting`.
    pub(crate) fn await_lock(
        &self,
        log: &Arc<Log>,
        obj: &DistObject,
        record: &mut MutexGuard<'_, ObjectRecord>,
        mode: LockMode,
    ) -> Result<()> {
        let config = self.covenant.config();
        let mut flagged: HashSet<u64> = HashSet::new();
        let mut first_wait = true;
        loop {
            release_orphaned_write_lock(obj, record);
            let blockers = blockers(log, obj, record, mode);
            // Published before the signal check so a concurrent flag_retry
            // knows which monitor to notify.
            if !blockers.is_empty() {
                log.set_waiting(obj, blockers.iter().map(Arc::downgrade).collect());
            }
            if let Some(signal) = log.retry_signal() {
                log.clear_waiting();
                return Err(CovenantError::TransactionRestarting { tid: signal.tid });
            }
            if blockers.is_empty() {
                log.clear_waiting();
                return Ok(());
            }

            if mode == LockMode::Write {
                for reader in obj.read_entry().conflicting_readers(log.tid()) {
                    if flagged.insert(reader.id()) {
                        reader.flag_retry(RetryCause::ReadLockRevoked {
                            by: log.tid().clone(),
                        })?;
                    }
                }
            }

            log.stats().record_lock_wait();
            let timeout = if first_wait {
                config.short_lock_wait()
            } else {
                config.long_lock_wait()
            };
            first_wait = false;
            if obj.monitor().wait_for(record, timeout).timed_out() {
                debug!(
                    "{} still waiting for {:?} lock on {}",
                    log.tid(),
                    mode,
                    obj.oid()
                );
                self.covenant.detector().request(log);
            }
        }
    }
}

/// Logs currently preventing `log` from taking the lock.
fn blockers(
    log: &Arc<Log>,
    obj: &DistObject,
    record: &ObjectRecord,
    mode: LockMode,
) -> Vec<Arc<Log>> {
    let mut blockers = Vec::new();
    if let Some(holder) = &record.holder {
        if !log.tid().is_descendant_of(&holder.tid) {
            if let Some(holder_log) = holder.log.upgrade() {
                blockers.push(holder_log);
            }
        }
    }
    if mode == LockMode::Write {
        for reader in obj.read_entry().conflicting_readers(log.tid()) {
            if !blockers.iter().any(|b| b.id() == reader.id()) {
                blockers.push(reader);
            }
        }
    }
    blockers
}

/// Rolls back write-lock layers whose holding log no longer exists.
fn release_orphaned_write_lock(obj: &DistObject, record: &mut ObjectRecord) {
    while let Some(holder) = &record.holder {
        if holder.log.strong_count() > 0 {
            return;
        }
        warn!("Rolling back orphaned write lock of {} on {}", holder.tid, obj.oid());
        if !record.rollback() {
            record.holder = None;
            record.writer = None;
            return;
        }
    }
}
