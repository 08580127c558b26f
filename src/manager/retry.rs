use log::debug;
use std::thread;
use std::time::Duration;

use crate::config::CovenantConfig;
use crate::errors::{CovenantError, Result};
use crate::manager::TransactionManager;

/// Backoff between attempts of a transactional body.
///
/// The counter starts at 1 and doubles on every other failure, up to the
/// configured maximum. Attempts only sleep, for `counter` milliseconds, once
/// the counter has grown past the sleep threshold.
#[derive(Debug, Clone)]
pub struct Backoff {
    counter: u64,
    double_next: bool,
    threshold: u64,
    max: u64,
    enabled: bool,
}

impl Backoff {
    pub fn new(config: &CovenantConfig) -> Self {
        Self {
            counter: 1,
            double_next: true,
            threshold: config.backoff_sleep_threshold,
            max: config.max_backoff_ms,
            enabled: config.use_backoff,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Records a failed attempt and returns how long to sleep before the next.
    pub fn on_failure(&mut self) -> Option<Duration> {
        let delay = (self.enabled && self.counter > self.threshold)
            .then(|| Duration::from_millis(self.counter));
        if self.double_next {
            self.counter = (self.counter * 2).min(self.max);
        }
        self.double_next = !self.double_next;
        delay
    }
}

impl TransactionManager {
    /// Runs `body` in a new transaction nested in the current one, retrying it
    /// until it commits or fails with an error that belongs to some other
    /// level.
    ///
    /// * `Retry` and `TransactionRestarting` for this level re-run the body.
    /// * `LockConflict` re-runs the body if some read turned out to be stale,
    ///   and is returned otherwise.
    /// * Everything else is returned after this level has been aborted.
    pub fn run_in_transaction<T>(
        &mut self,
        mut body: impl FnMut(&mut TransactionManager) -> Result<T>,
    ) -> Result<T> {
        let mut backoff = Backoff::new(self.covenant.config());
        loop {
            let tid = self.start_transaction()?;
            let outcome = body(self).and_then(|value| {
                if self.is_open(&tid) {
                    self.commit_transaction().map(|()| value)
                } else {
                    Err(CovenantError::TransactionRestarting { tid: tid.clone() })
                }
            });
            let e = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let stale = match &e {
                CovenantError::LockConflict { .. } if self.is_open(&tid) => {
                    self.check_for_stale_objects().unwrap_or(false)
                }
                _ => false,
            };
            if self.is_open(&tid) {
                self.abort_through(&tid)?;
            }

            let retry = match &e {
                CovenantError::LockConflict { oid } => {
                    debug!("Lock conflict on {} in {}, stale reads: {}", oid, tid, stale);
                    stale
                }
                other => other.restarts(&tid),
            };
            if !retry {
                return Err(e);
            }
            debug!("Retrying {} after {}", tid, e);
            if let Some(delay) = backoff.on_failure() {
                thread::sleep(delay);
            }
        }
    }
}
