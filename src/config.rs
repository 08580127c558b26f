use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for a [`Covenant`](crate::Covenant) instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CovenantConfig {
    /// Name this worker is known by in writer maps.
    pub worker_name: String,
    /// Name of the in-process store. Objects on it never cause network traffic.
    pub local_store_name: String,
    /// Whether the retry combinator sleeps between attempts.
    pub use_backoff: bool,
    /// First, short lock wait.
    pub short_lock_wait_ms: u64,
    /// Every subsequent lock wait.
    pub long_lock_wait_ms: u64,
    /// Upper bound for the backoff counter.
    pub max_backoff_ms: u64,
    /// The backoff counter only causes a sleep once it exceeds this value.
    pub backoff_sleep_threshold: u64,
}

impl Default for CovenantConfig {
    fn default() -> Self {
        Self {
            worker_name: "local".to_string(),
            local_store_name: "local".to_string(),
            use_backoff: true,
            short_lock_wait_ms: 10,
            long_lock_wait_ms: 1000,
            max_backoff_ms: 5000,
            backoff_sleep_threshold: 32,
        }
    }
}

impl CovenantConfig {
    pub(crate) fn short_lock_wait(&self) -> Duration {
        Duration::from_millis(self.short_lock_wait_ms)
    }

    pub(crate) fn long_lock_wait(&self) -> Duration {
        Duration::from_millis(self.long_lock_wait_ms)
    }
}
