use ahash::AHashSet as HashSet;
use parking_lot::{Condvar, Mutex};

use crate::errors::{CovenantError, Result};
use crate::tid::TransactionId;
use crate::twopc::Participant;

/// Phase of a top-level transaction in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Unprepared,
    /// Phase 1 is running.
    PreparingWrites,
    /// Phase 1 finished; a commit time has been chosen.
    WritesPrepared,
    /// Phase 2 is running for the recorded commit time.
    PreparingReads,
    Prepared,
    PrepareFailed,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl CommitPhase {
    /// The `PREPARING` state: some thread is in the middle of phase 1 or 2.
    pub fn is_preparing(self) -> bool {
        matches!(self, CommitPhase::PreparingWrites | CommitPhase::PreparingReads)
    }
}

struct Inner {
    phase: CommitPhase,
    commit_time: u64,
    /// Participants that acknowledged a prepare and must hear the outcome.
    prepared: HashSet<Participant>,
}

/// Commit-protocol state of a top-level transaction, shared by every log in
/// its chain. Sub-transactions never transition it.
pub struct CommitState {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for CommitState {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: CommitPhase::Unprepared,
                commit_time: 0,
                prepared: HashSet::new(),
            }),
            changed: Condvar::new(),
        }
    }

    pub fn phase(&self) -> CommitPhase {
        self.inner.lock().phase
    }

    pub fn commit_time(&self) -> u64 {
        self.inner.lock().commit_time
    }

    /// Enters phase 1. Returns `None` if the caller must run it, or the commit
    /// time already chosen by another caller.
    pub(crate) fn begin_prepare_writes(&self, tid: &TransactionId) -> Result<Option<u64>> {
        let mut inner = self.inner.lock();
        loop {
            match inner.phase {
                CommitPhase::Unprepared => {
                    inner.phase = CommitPhase::PreparingWrites;
                    return Ok(None);
                }
                CommitPhase::PreparingWrites => self.changed.wait(&mut inner),
                CommitPhase::WritesPrepared
                | CommitPhase::PreparingReads
                | CommitPhase::Prepared => return Ok(Some(inner.commit_time)),
                CommitPhase::PrepareFailed | CommitPhase::Aborting | CommitPhase::Aborted => {
                    return Err(CovenantError::TransactionRestarting { tid: tid.clone() });
                }
                CommitPhase::Committing | CommitPhase::Committed => {
                    return Err(CovenantError::Internal(format!(
                        "prepare requested for {} after commit began",
                        tid
                    )));
                }
            }
        }
    }

    pub(crate) fn finish_prepare_writes(&self, commit_time: u64) {
        let mut inner = self.inner.lock();
        inner.phase = CommitPhase::WritesPrepared;
        inner.commit_time = inner.commit_time.max(commit_time);
        self.changed.notify_all();
    }

    /// Enters phase 2 for `commit_time`. Returns `false` if a finished or
    /// running prepare already covers a commit time at least that late.
    pub(crate) fn begin_prepare_reads(&self, tid: &TransactionId, commit_time: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        loop {
            match inner.phase {
                CommitPhase::PreparingReads | CommitPhase::Prepared
                    if inner.commit_time >= commit_time =>
                {
                    return Ok(false);
                }
                CommitPhase::PreparingWrites | CommitPhase::PreparingReads => {
                    self.changed.wait(&mut inner)
                }
                CommitPhase::WritesPrepared | CommitPhase::Prepared => {
                    inner.phase = CommitPhase::PreparingReads;
                    inner.commit_time = inner.commit_time.max(commit_time);
                    return Ok(true);
                }
                CommitPhase::PrepareFailed | CommitPhase::Aborting | CommitPhase::Aborted => {
                    return Err(CovenantError::TransactionRestarting { tid: tid.clone() });
                }
                CommitPhase::Unprepared | CommitPhase::Committing | CommitPhase::Committed => {
                    return Err(CovenantError::Internal(format!(
                        "read prepare for {} attempted in phase {:?}",
                        tid, inner.phase
                    )));
                }
            }
        }
    }

    pub(crate) fn finish_prepare_reads(&self) {
        let mut inner = self.inner.lock();
        inner.phase = CommitPhase::Prepared;
        self.changed.notify_all();
    }

    pub(crate) fn mark_prepare_failed(&self) {
        let mut inner = self.inner.lock();
        inner.phase = CommitPhase::PrepareFailed;
        self.changed.notify_all();
    }

    /// Enters phase 3 and returns the agreed commit time.
    pub(crate) fn begin_commit(&self, tid: &TransactionId) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.phase {
            CommitPhase::Prepared => {
                inner.phase = CommitPhase::Committing;
                Ok(inner.commit_time)
            }
            CommitPhase::PrepareFailed | CommitPhase::Aborting | CommitPhase::Aborted => {
                Err(CovenantError::TransactionRestarting { tid: tid.clone() })
            }
            phase => Err(CovenantError::Internal(format!(
                "commit of {} attempted in phase {:?}",
                tid, phase
            ))),
        }
    }

    pub(crate) fn mark_committed(&self) {
        let mut inner = self.inner.lock();
        inner.phase = CommitPhase::Committed;
        self.changed.notify_all();
    }

    /// Moves to `Aborting`, first waiting out any prepare in progress on another
    /// thread. Returns `false` if the transaction is already aborting, aborted
    /// or committed, in which case no abort messages must be sent.
    pub(crate) fn begin_abort(&self) -> bool {
        let mut inner = self.inner.lock();
        while inner.phase.is_preparing() {
            self.changed.wait(&mut inner);
        }
        match inner.phase {
            CommitPhase::Aborting
            | CommitPhase::Aborted
            | CommitPhase::Committing
            | CommitPhase::Committed => false,
            _ => {
                inner.phase = CommitPhase::Aborting;
                true
            }
        }
    }

    pub(crate) fn mark_aborted(&self) {
        let mut inner = self.inner.lock();
        inner.phase = CommitPhase::Aborted;
        self.changed.notify_all();
    }

    pub(crate) fn record_prepared(&self, participant: Participant) {
        self.inner.lock().prepared.insert(participant);
    }

    pub(crate) fn prepared_participants(&self) -> Vec<Participant> {
        let mut prepared: Vec<Participant> = self.inner.lock().prepared.iter().cloned().collect();
        prepared.sort();
        prepared
    }

    pub(crate) fn was_prepared(&self, participant: &Participant) -> bool {
        self.inner.lock().prepared.contains(participant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn prepared_at(state: &CommitState, tid: &TransactionId, commit_time: u64) {
        assert_eq!(state.begin_prepare_writes(tid).unwrap(), None);
        state.finish_prepare_writes(commit_time);
        assert!(state.begin_prepare_reads(tid, commit_time).unwrap());
        state.finish_prepare_reads();
    }

    #[test]
    fn new_state_is_unprepared() {
        let state = CommitState::new();
        assert_eq!(state.phase(), CommitPhase::Unprepared);
        assert_eq!(state.commit_time(), 0);
        assert!(state.prepared_participants().is_empty());
    }

    #[test]
    fn second_prepare_writes_reuses_commit_time() {
        let tid = TransactionId::new_top_level();
        let state = CommitState::new();
        assert_eq!(state.begin_prepare_writes(&tid).unwrap(), None);
        state.finish_prepare_writes(50);
        assert_eq!(state.phase(), CommitPhase::WritesPrepared);
        assert_eq!(state.begin_prepare_writes(&tid).unwrap(), Some(50));
        assert_eq!(state.phase(), CommitPhase::WritesPrepared);
    }

    #[test]
    fn prepare_reads_skips_covered_commit_time() {
        let tid = TransactionId::new_top_level();
        let state = CommitState::new();
        prepared_at(&state, &tid, 50);

        assert!(!state.begin_prepare_reads(&tid, 50).unwrap());
        assert!(!state.begin_prepare_reads(&tid, 40).unwrap());
        assert_eq!(state.phase(), CommitPhase::Prepared);

        // A later time needs a fresh round.
        assert!(state.begin_prepare_reads(&tid, 60).unwrap());
        assert_eq!(state.phase(), CommitPhase::PreparingReads);
        assert_eq!(state.commit_time(), 60);
        state.finish_prepare_reads();
        assert_eq!(state.begin_commit(&tid).unwrap(), 60);
    }

    #[test]
    fn aborting_refuses_prepare_and_commit() {
        let tid = TransactionId::new_top_level();
        let state = CommitState::new();
        assert!(state.begin_abort());
        assert_eq!(state.phase(), CommitPhase::Aborting);
        assert!(matches!(
            state.begin_prepare_writes(&tid),
            Err(CovenantError::TransactionRestarting { .. })
        ));
        assert!(matches!(
            state.begin_commit(&tid),
            Err(CovenantError::TransactionRestarting { .. })
        ));

        state.mark_aborted();
        assert!(!state.begin_abort());
        assert!(matches!(
            state.begin_prepare_writes(&tid),
            Err(CovenantError::TransactionRestarting { .. })
        ));
        assert!(matches!(
            state.begin_commit(&tid),
            Err(CovenantError::TransactionRestarting { .. })
        ));
    }

    #[test]
    fn failed_prepare_refuses_commit() {
        let tid = TransactionId::new_top_level();
        let state = CommitState::new();
        assert_eq!(state.begin_prepare_writes(&tid).unwrap(), None);
        state.mark_prepare_failed();
        match state.begin_commit(&tid) {
            Err(CovenantError::TransactionRestarting { tid: restarted }) => {
                assert_eq!(restarted, tid)
            }
            other => panic!("Expected TransactionRestarting, got {:?}", other),
        }
        // The abort that follows still has to go out.
        assert!(state.begin_abort());
    }

    #[test]
    fn committing_cannot_be_aborted() {
        let tid = TransactionId::new_top_level();
        let state = CommitState::new();
        prepared_at(&state, &tid, 10);
        assert_eq!(state.begin_commit(&tid).unwrap(), 10);
        assert!(!state.begin_abort());
        state.mark_committed();
        assert!(!state.begin_abort());
        assert_eq!(state.phase(), CommitPhase::Committed);
    }

    #[test]
    fn abort_waits_for_running_prepare() {
        let tid = TransactionId::new_top_level();
        let state = Arc::new(CommitState::new());
        assert_eq!(state.begin_prepare_writes(&tid).unwrap(), None);

        let aborted = Arc::new(AtomicBool::new(false));
        let handle = {
            let state = state.clone();
            let aborted = aborted.clone();
            thread::spawn(move || {
                let sends_aborts = state.begin_abort();
                aborted.store(true, Ordering::SeqCst);
                sends_aborts
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!aborted.load(Ordering::SeqCst));
        assert_eq!(state.phase(), CommitPhase::PreparingWrites);

        state.finish_prepare_writes(20);
        assert!(handle.join().unwrap());
        assert!(aborted.load(Ordering::SeqCst));
        assert_eq!(state.phase(), CommitPhase::Aborting);
        // The prepare that finished meanwhile may not commit any more.
        assert!(matches!(
            state.begin_prepare_reads(&tid, 20),
            Err(CovenantError::TransactionRestarting { .. })
        ));
    }

    #[test]
    fn concurrent_prepare_writes_waits_for_first_run() {
        let tid = TransactionId::new_top_level();
        let state = Arc::new(CommitState::new());
        assert_eq!(state.begin_prepare_writes(&tid).unwrap(), None);

        let handle = {
            let state = state.clone();
            let tid = tid.clone();
            thread::spawn(move || state.begin_prepare_writes(&tid).unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        state.finish_prepare_writes(30);
        assert_eq!(handle.join().unwrap(), Some(30));
    }
}
