use thiserror::Error;

use crate::data_store::object::Oid;
use crate::tid::TransactionId;
use crate::twopc::{Participant, ParticipantError};

#[derive(Error, Debug)]
pub enum CovenantError {
    /// The body asked to be re-run at the current nesting level.
    #[error("Transaction requested a retry")]
    Retry,

    /// A retry signal or a failed prepare forces `tid` (and everything below it) to restart.
    #[error("Transaction {tid} is restarting")]
    TransactionRestarting { tid: TransactionId },

    /// A remote worker refused to hand over an object.
    #[error("Lock conflict on object {oid}")]
    LockConflict { oid: Oid },

    /// A participant failed after prepare succeeded. Some participants may have committed.
    #[error("Atomicity violation while committing {tid}: {failures:?}")]
    AtomicityViolation {
        tid: TransactionId,
        failures: Vec<(Participant, ParticipantError)>,
    },

    #[error("No transaction is active")]
    NoActiveTransaction,

    #[error("Participant error: {0}")]
    Participant(#[from] ParticipantError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CovenantError {
    /// Returns `true` if this error asks the transaction identified by `tid` to run again.
    pub fn restarts(&self, tid: &TransactionId) -> bool {
        match self {
            CovenantError::Retry => true,
            CovenantError::TransactionRestarting { tid: target } => target == tid,
            _ => false,
        }
    }

    /// Whether the error belongs to the recoverable abort-and-retry family.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CovenantError::Retry
                | CovenantError::TransactionRestarting { .. }
                | CovenantError::LockConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CovenantError>;
