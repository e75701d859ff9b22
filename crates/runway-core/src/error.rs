//! Error types for runway.

use thiserror::Error;

/// How a caller is expected to react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried automatically within the job's retry budget.
    Transient,
    /// Expected under concurrent schedulers; re-read and try again.
    Contention,
    /// Recorded as a job failure and rolled up.
    Permanent,
    /// A data-layer invariant was observed broken.
    Invariant,
    /// Caller mistakes, missing records and infrastructure errors.
    Other,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("duplicate queue entry: {0}")]
    DuplicateEntry(String),

    #[error("already leased: {0}")]
    AlreadyLeased(String),

    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("not the lease holder: {0}")]
    NotLeaseHolder(String),

    #[error("stale state: {0}")]
    StaleState(String),

    #[error("lease expired: {0}")]
    LeaseExpired(String),

    #[error("runner unavailable: {0}")]
    RunnerUnavailable(String),

    #[error("no matching runner: {0}")]
    NoMatchingRunner(String),

    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LeaseExpired(_) | Error::Timeout(_) => ErrorKind::Transient,
            Error::AlreadyLeased(_) | Error::StaleState(_) => ErrorKind::Contention,
            Error::NoMatchingRunner(_) | Error::RetriesExhausted(_) => ErrorKind::Permanent,
            Error::InvariantViolation(_) => ErrorKind::Invariant,
            _ => ErrorKind::Other,
        }
    }

    /// True when the caller should re-read state and retry.
    pub fn is_contention(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}

pub type Result<T> = std::result::Result<T, Error>;
