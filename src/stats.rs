use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-transaction counters, shared by every log of a top-level chain.
#[derive(Debug)]
pub struct TxnStats {
    started: Instant,
    lock_waits: AtomicU64,
    deadlock_requests: AtomicU64,
    retries: AtomicU64,
    prepare_failures: AtomicU64,
    commit_latency_ms: AtomicU64,
}

impl Default for TxnStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            lock_waits: AtomicU64::new(0),
            deadlock_requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            prepare_failures: AtomicU64::new(0),
            commit_latency_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deadlock_request(&self) {
        self.deadlock_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_prepare_failure(&self) {
        self.prepare_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_latency(&self, since: Instant) {
        self.commit_latency_ms
            .store(since.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn lock_waits(&self) -> u64 {
        self.lock_waits.load(Ordering::Relaxed)
    }

    pub fn deadlock_requests(&self) -> u64 {
        self.deadlock_requests.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn prepare_failures(&self) -> u64 {
        self.prepare_failures.load(Ordering::Relaxed)
    }

    /// Duration of the last top-level commit protocol run, in milliseconds.
    pub fn commit_latency_ms(&self) -> u64 {
        self.commit_latency_ms.load(Ordering::Relaxed)
    }

    /// Time since the top-level transaction started, in milliseconds.
    pub fn age_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn summary(&self) -> String {
        format!(
            "age={}ms lock_waits={} deadlock_requests={} retries={} prepare_failures={} commit={}ms",
            self.age_ms(),
            self.lock_waits(),
            self.deadlock_requests(),
            self.retries(),
            self.prepare_failures(),
            self.commit_latency_ms(),
        )
    }
}
