use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Instant;

use crate::current_time_millis;
use crate::data_store::object::{ObjectImage, Oid};
use crate::errors::{CovenantError, Result};
use crate::log::Log;
use crate::manager::TransactionManager;
use crate::manager::fanout::{FailureMap, Task, fan_out, sorted_failures};
use crate::twopc::{ExtendedWarranty, Participant, ParticipantError, ReadVersion};

/// Outcome of phase one.
struct PreparedWrites {
    commit_time: u64,
    /// Reads stores asked to have validated together with the writes.
    added_reads: HashMap<String, Vec<ReadVersion>>,
}

fn unknown(participant: &Participant) -> ParticipantError {
    ParticipantError::Unreachable(format!("no {} is registered", participant))
}

impl TransactionManager {
    /// Commits the innermost transaction.
    ///
    /// A sub-transaction is folded into its parent. A top-level transaction
    /// runs the distributed protocol: prepare writes, prepare reads at the
    /// chosen commit time, then commit.
    ///
    /// # Returns
    ///
    /// * `TransactionRestarting` if a retry signal was pending or a participant
    ///   refused to prepare. The transaction has been aborted everywhere.
    /// * `AtomicityViolation` if a participant failed after every participant
    ///   had prepared. The transaction is committed locally.
    pub fn commit_transaction(&mut self) -> Result<()> {
        self.check_retry_signal()?;
        let log = self.require_current()?;
        if log.is_top_level() {
            return self.commit_top_level(log);
        }
        log.commit_nested()?;
        self.current = log.parent().cloned();
        Ok(())
    }

    fn commit_top_level(&mut self, log: Arc<Log>) -> Result<()> {
        let started = Instant::now();
        let prepared = match self.prepare_writes(&log) {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(failures)) => return Err(self.fail_prepare(&log, failures)),
            Err(e) => return Err(self.fail_protocol(&log, e)),
        };
        match self.prepare_reads(&log, prepared.commit_time, prepared.added_reads) {
            Ok(Ok(())) => {}
            Ok(Err(failures)) => return Err(self.fail_prepare(&log, failures)),
            Err(e) => return Err(self.fail_protocol(&log, e)),
        }
        self.send_commit(&log, started)
    }

    /// Phase one. Ships creates, writes and lock intents to every store that
    /// has some, and asks every called worker to prepare its share.
    fn prepare_writes(&self, log: &Arc<Log>) -> Result<std::result::Result<PreparedWrites, FailureMap>> {
        let tid = log.tid().clone();
        let now = current_time_millis();
        if let Some(commit_time) = log.commit_state().begin_prepare_writes(&tid)? {
            return Ok(Ok(PreparedWrites {
                commit_time,
                added_reads: HashMap::new(),
            }));
        }

        let mut unknown_participants = FailureMap::new();
        let mut tasks: Vec<Task<'_, (u64, Vec<ReadVersion>)>> = Vec::new();
        for name in log.workers_called() {
            let participant = Participant::Worker(name.clone());
            let Some(worker) = self.covenant.worker(&name) else {
                unknown_participants.insert(participant.clone(), unknown(&participant));
                continue;
            };
            let tid = tid.clone();
            tasks.push((
                participant,
                Box::new(move || {
                    worker
                        .prepare_transaction_writes(&tid)
                        .map(|commit_time| (commit_time, Vec::new()))
                }),
            ));
        }

        let mut writes: Vec<_> = log
            .writes_by_store()
            .into_iter()
            .filter(|(_, request)| !request.is_empty())
            .collect();
        writes.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, request) in writes {
            let participant = Participant::Store(name.clone());
            let Some(store) = self.covenant.store(&name) else {
                unknown_participants.insert(participant.clone(), unknown(&participant));
                continue;
            };
            let tid = tid.clone();
            tasks.push((
                participant,
                Box::new(move || {
                    store
                        .prepare_transaction_writes(&tid, &request)
                        .map(|result| (result.commit_time, result.added_reads))
                }),
            ));
        }
        if !unknown_participants.is_empty() {
            return Ok(Err(unknown_participants));
        }

        let contacted = tasks.len();
        let (successes, failures) = fan_out(tasks);
        for (participant, _) in &successes {
            log.commit_state().record_prepared(participant.clone());
        }
        if !failures.is_empty() {
            return Ok(Err(failures));
        }

        let commit_time = successes
            .iter()
            .map(|(_, (commit_time, _))| *commit_time)
            .fold(now, u64::max);
        let mut added_reads: HashMap<String, Vec<ReadVersion>> = HashMap::new();
        for (participant, (_, reads)) in successes {
            if let Participant::Store(name) = participant {
                if !reads.is_empty() {
                    added_reads.entry(name).or_default().extend(reads);
                }
            }
        }
        log.commit_state().finish_prepare_writes(commit_time);
        debug!(
            "Prepared writes of {} at {} participants, commit time {}",
            tid, contacted, commit_time
        );
        Ok(Ok(PreparedWrites {
            commit_time,
            added_reads,
        }))
    }

    /// Phase two. Asks every remote store that was read from to certify the
    /// read versions up to `commit_time`, and every called worker to do the
    /// same for its share.
    fn prepare_reads(
        &self,
        log: &Arc<Log>,
        commit_time: u64,
        added_reads: HashMap<String, Vec<ReadVersion>>,
    ) -> Result<std::result::Result<(), FailureMap>> {
        let tid = log.tid().clone();
        if !log.commit_state().begin_prepare_reads(&tid, commit_time)? {
            return Ok(Ok(()));
        }

        let mut reads = log.reads_by_store();
        for (store, extra) in added_reads {
            reads.entry(store).or_default().extend(extra);
        }
        let mut reads: Vec<_> = reads
            .into_iter()
            .filter(|(store, versions)| !versions.is_empty() && !self.covenant.is_local_store(store))
            .collect();
        reads.sort_by(|a, b| a.0.cmp(&b.0));

        let mut unknown_participants = FailureMap::new();
        let mut tasks: Vec<Task<'_, Vec<ExtendedWarranty>>> = Vec::new();
        for name in log.workers_called() {
            let participant = Participant::Worker(name.clone());
            let Some(worker) = self.covenant.worker(&name) else {
                unknown_participants.insert(participant.clone(), unknown(&participant));
                continue;
            };
            let tid = tid.clone();
            tasks.push((
                participant,
                Box::new(move || {
                    worker
                        .prepare_transaction_reads(&tid, commit_time)
                        .map(|()| Vec::new())
                }),
            ));
        }
        for (name, versions) in reads {
            let participant = Participant::Store(name.clone());
            let Some(store) = self.covenant.store(&name) else {
                unknown_participants.insert(participant.clone(), unknown(&participant));
                continue;
            };
            let tid = tid.clone();
            tasks.push((
                participant,
                Box::new(move || store.prepare_transaction_reads(&tid, &versions, commit_time)),
            ));
        }
        if !unknown_participants.is_empty() {
            return Ok(Err(unknown_participants));
        }

        let (successes, failures) = fan_out(tasks);
        for (participant, _) in &successes {
            log.commit_state().record_prepared(participant.clone());
        }
        if !failures.is_empty() {
            return Ok(Err(failures));
        }

        let read_map = self.covenant.read_map();
        for (participant, warranties) in successes {
            let Participant::Store(name) = participant else {
                continue;
            };
            for warranty in warranties {
                if let Some(entry) = read_map.get(&Oid::new(name.clone(), warranty.onum)) {
                    entry.extend_expiry(warranty.expiry);
                }
            }
        }
        log.commit_state().finish_prepare_reads();
        Ok(Ok(()))
    }

    /// Phase three. Failures here cannot be undone any more.
    fn send_commit(&mut self, log: &Arc<Log>, started: Instant) -> Result<()> {
        let tid = log.tid().clone();
        let commit_time = match log.commit_state().begin_commit(&tid) {
            Ok(commit_time) => commit_time,
            Err(e) => return Err(self.fail_protocol(log, e)),
        };

        let mut failures = FailureMap::new();
        let mut tasks: Vec<Task<'_, ()>> = Vec::new();
        for participant in self.participants_to_notify(log, &[]) {
            match &participant {
                Participant::Store(name) => {
                    let Some(store) = self.covenant.store(name) else {
                        failures.insert(participant.clone(), unknown(&participant));
                        continue;
                    };
                    let was_contacted = log.commit_state().was_prepared(&participant);
                    let tid = tid.clone();
                    tasks.push((
                        participant,
                        Box::new(move || store.commit_transaction(&tid, commit_time, was_contacted)),
                    ));
                }
                Participant::Worker(name) => {
                    let Some(worker) = self.covenant.worker(name) else {
                        failures.insert(participant.clone(), unknown(&participant));
                        continue;
                    };
                    let tid = tid.clone();
                    tasks.push((
                        participant,
                        Box::new(move || worker.commit_transaction(&tid, commit_time)),
                    ));
                }
            }
        }
        let (_, commit_failures) = fan_out(tasks);
        failures.extend(commit_failures);

        let outcome = log.commit_top_level();
        log.commit_state().mark_committed();
        self.covenant.merge_labels(outcome.labels);
        self.covenant.unregister_transaction(&tid);
        self.current = None;
        log.stats().record_commit_latency(started);

        if !failures.is_empty() {
            let failures = sorted_failures(failures);
            error!(
                "Atomicity violation committing {}: {:?}",
                tid, failures
            );
            return Err(CovenantError::AtomicityViolation { tid, failures });
        }

        let mut extensions: Vec<_> = outcome.extensions.into_iter().collect();
        extensions.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, onums) in extensions {
            match self.covenant.store(&name) {
                Some(store) => {
                    if let Err(e) = store.send_extensions(&onums) {
                        warn!("Sending extensions for {} to {} failed: {}", tid, name, e);
                    }
                }
                None => warn!("No store {} for extensions of {}", name, tid),
            }
        }
        debug!(
            "Committed {} at {} [{}]",
            tid,
            commit_time,
            log.stats().summary()
        );
        Ok(())
    }

    /// Everyone that must hear the outcome of `log`: prepared participants and
    /// every worker that ran part of it.
    fn participants_to_notify(&self, log: &Arc<Log>, excluded: &[Participant]) -> Vec<Participant> {
        let mut participants: HashSet<Participant> =
            log.commit_state().prepared_participants().into_iter().collect();
        participants.extend(log.workers_called().into_iter().map(Participant::Worker));
        let mut participants: Vec<Participant> = participants
            .into_iter()
            .filter(|p| !excluded.contains(p))
            .collect();
        participants.sort();
        participants
    }

    /// Handles a rejected prepare: abort everywhere, refresh the cache from the
    /// conflicts the participants reported, and ask for a restart.
    fn fail_prepare(&mut self, log: &Arc<Log>, failures: FailureMap) -> CovenantError {
        let tid = log.tid().clone();
        log.stats().record_prepare_failure();
        for (participant, e) in sorted_failures(failures.clone()) {
            warn!("Prepare of {} failed at {}: {}", tid, participant, e);
        }
        log.commit_state().mark_prepare_failed();
        let failed: Vec<Participant> = failures.keys().cloned().collect();
        self.abort_top_level(log, &failed);

        let mut refreshed = 0;
        for e in failures.values() {
            for image in e.conflicts() {
                if self.covenant.object_cache().apply_image(image) {
                    refreshed += 1;
                }
            }
        }
        if refreshed > 0 {
            debug!("Refreshed {} cached objects after failed prepare of {}", refreshed, tid);
        }
        CovenantError::TransactionRestarting { tid }
    }

    /// The commit state refused to proceed, typically because another thread
    /// aborted the transaction. Make sure the local chain is gone too.
    fn fail_protocol(&mut self, log: &Arc<Log>, e: CovenantError) -> CovenantError {
        if matches!(e, CovenantError::TransactionRestarting { .. }) {
            self.abort_top_level(log, &[]);
        }
        e
    }

    /// Aborts the top-level transaction `log` locally and at every participant
    /// that must hear about it, except `excluded`.
    pub(crate) fn abort_top_level(&mut self, log: &Arc<Log>, excluded: &[Participant]) {
        let tid = log.tid().clone();
        if log.commit_state().begin_abort() {
            let mut tasks: Vec<Task<'_, ()>> = Vec::new();
            for participant in self.participants_to_notify(log, excluded) {
                let tid = tid.clone();
                match &participant {
                    Participant::Store(name) => {
                        if let Some(store) = self.covenant.store(name) {
                            tasks.push((participant, Box::new(move || store.abort_transaction(&tid))));
                        }
                    }
                    Participant::Worker(name) => {
                        if let Some(worker) = self.covenant.worker(name) {
                            tasks.push((participant, Box::new(move || worker.abort_transaction(&tid))));
                        }
                    }
                }
            }
            let (_, failures) = fan_out(tasks);
            for (participant, e) in sorted_failures(failures) {
                warn!("Abort of {} at {} failed: {}", tid, participant, e);
            }
        }
        log.abort();
        log.commit_state().mark_aborted();
        self.covenant.unregister_transaction(&tid);
        if self.current.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, log)) {
            self.current = None;
        }
        debug!("Aborted top-level {} [{}]", tid, log.stats().summary());
    }

    /// Asks every store and worker the current chain read from whether any of
    /// those reads are out of date, refreshing the cache with whatever newer
    /// copies come back.
    ///
    /// # Returns
    ///
    /// `true` if at least one participant reported a newer version.
    pub fn check_for_stale_objects(&mut self) -> Result<bool> {
        let Some(log) = self.current.clone() else {
            return Ok(false);
        };
        let tid = log.tid().clone();
        let mut reads: HashMap<String, Vec<ReadVersion>> = HashMap::new();
        let mut workers: HashSet<String> = HashSet::new();
        let mut cursor = Some(log);
        while let Some(level) = cursor {
            for (store, versions) in level.reads_by_store() {
                reads.entry(store).or_default().extend(versions);
            }
            workers.extend(level.workers_called());
            cursor = level.parent().cloned();
        }

        let mut tasks: Vec<Task<'_, (bool, Vec<ObjectImage>)>> = Vec::new();
        let mut reads: Vec<_> = reads.into_iter().collect();
        reads.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, versions) in reads {
            if let Some(store) = self.covenant.store(&name) {
                tasks.push((
                    Participant::Store(name),
                    Box::new(move || {
                        store
                            .check_for_stale_objects(&versions)
                            .map(|images| (!images.is_empty(), images))
                    }),
                ));
            }
        }
        let mut workers: Vec<_> = workers.into_iter().collect();
        workers.sort();
        for name in workers {
            if let Some(worker) = self.covenant.worker(&name) {
                let tid = tid.clone();
                tasks.push((
                    Participant::Worker(name),
                    Box::new(move || worker.check_for_stale_objects(&tid).map(|stale| (stale, Vec::new()))),
                ));
            }
        }

        let (reports, failures) = fan_out(tasks);
        for (participant, e) in sorted_failures(failures) {
            warn!("Stale check of {} at {} failed: {}", tid, participant, e);
        }
        let mut stale = false;
        for (participant, (found, images)) in reports {
            if found {
                debug!("{} reports stale reads for {}", participant, tid);
                stale = true;
            }
            for image in &images {
                self.covenant.object_cache().apply_image(image);
            }
        }
        Ok(stale)
    }
}
