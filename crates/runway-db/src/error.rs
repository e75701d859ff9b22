//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A conditional write found a different prior state.
    #[error("stale state: {0}")]
    Stale(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// A stored value could not be mapped back onto the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<runway_core::Error> for DbError {
    fn from(err: runway_core::Error) -> Self {
        match err {
            runway_core::Error::IllegalTransition(msg) => DbError::IllegalTransition(msg),
            other => DbError::Corrupt(other.to_string()),
        }
    }
}

impl From<DbError> for runway_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => runway_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => runway_core::Error::DuplicateEntry(msg),
            DbError::Stale(msg) => runway_core::Error::StaleState(msg),
            DbError::IllegalTransition(msg) => runway_core::Error::IllegalTransition(msg),
            other => runway_core::Error::Internal(other.to_string()),
        }
    }
}
