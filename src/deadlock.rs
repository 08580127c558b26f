use ahash::AHashSet as HashSet;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crate::log::{Log, RetryCause};

enum DetectorCommand {
    /// Look for a wait cycle through the given (blocked) log.
    Check(Weak<Log>),
    Shutdown,
}

/// One hop of a wait cycle: `holder` holds a lock that the previous hop's
/// waiter is blocked on, and `waiter` is the log of `holder`'s thread that is
/// itself blocked.
struct Hop {
    holder: Arc<Log>,
    waiter: Arc<Log>,
}

/// Background thread that breaks wait cycles between transactions.
///
/// Threads blocked on a lock enqueue their log with [`DeadlockDetector::request`]
/// once their first wait times out. The detector walks the `waits_for` edges
/// from that log; if they lead back to it, the youngest transaction of the
/// cycle is told to retry.
pub struct DeadlockDetector {
    sender: Sender<DetectorCommand>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<DetectorCommand>();
        let handle = thread::Builder::new()
            .name("covenant-deadlock-detector".to_string())
            .spawn(move || Self::run(receiver))
            .ok();
        if handle.is_none() {
            warn!("Could not spawn the deadlock detector; cycles will only clear through timeouts");
        }
        Self { sender, handle }
    }

    /// Queues a detection request for `log`.
    pub fn request(&self, log: &Arc<Log>) {
        log.stats().record_deadlock_request();
        if self
            .sender
            .send(DetectorCommand::Check(Arc::downgrade(log)))
            .is_err()
        {
            debug!("Deadlock detector is gone, dropping request for {}", log.tid());
        }
    }

    fn run(receiver: Receiver<DetectorCommand>) {
        while let Ok(command) = receiver.recv() {
            match command {
                DetectorCommand::Check(log) => {
                    if let Some(log) = log.upgrade() {
                        Self::resolve(&log);
                    }
                }
                DetectorCommand::Shutdown => break,
            }
        }
        debug!("Deadlock detector shutting down");
    }

    /// Runs one detection pass from `start` and flags a victim if a cycle exists.
    /// Returns the victim's log.
    pub(crate) fn resolve(start: &Arc<Log>) -> Option<Arc<Log>> {
        if !start.is_waiting() {
            return None;
        }
        let cycle = Self::find_cycle(start)?;
        let victim = cycle
            .iter()
            .map(|hop| &hop.holder)
            .max_by_key(|holder| (holder.tid().top_tid(), holder.tid().depth()))?
            .clone();
        let members: Vec<String> = cycle.iter().map(|hop| hop.waiter.tid().to_string()).collect();
        debug!(
            "Deadlock among [{}], retrying {}",
            members.join(", "),
            victim.tid()
        );
        if let Err(e) = victim.flag_retry(RetryCause::Deadlock) {
            warn!("Failed to flag deadlock victim {}: {}", victim.tid(), e);
            return None;
        }
        Some(victim)
    }

    fn find_cycle(start: &Arc<Log>) -> Option<Vec<Hop>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if Self::search(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn search(
        start: &Arc<Log>,
        waiter: &Arc<Log>,
        visited: &mut HashSet<u64>,
        path: &mut Vec<Hop>,
    ) -> bool {
        if !visited.insert(waiter.id()) {
            return false;
        }
        for holder in waiter.waits_for() {
            let next = holder.innermost();
            if !next.is_waiting() {
                continue;
            }
            path.push(Hop {
                holder,
                waiter: next.clone(),
            });
            if next.id() == start.id() || Self::search(start, &next, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        let _ = self.sender.send(DetectorCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
