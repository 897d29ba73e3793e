//! Error taxonomy for the devicegate engine.
//!
//! Only infrastructure failures are errors here. Policy outcomes —
//! fingerprint drift, mismatch, device not approved — are returned as
//! typed results from the registration engine so the caller can decide
//! UX (prompt MFA, route to registration) without unwinding.

use thiserror::Error;

/// Failure inside the persistence adapter. Always carries the cause and
/// is never silently retried by the engine — retry policy belongs to the
/// caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The SQLite driver rejected a statement.
    #[error("sqlite statement failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Could not check a connection out of the pool (exhausted past the
    /// checkout timeout, or the database could not be opened).
    #[error("connection pool failure: {0}")]
    Pool(#[from] r2d2::Error),

    /// The blocking task running the statement was cancelled or panicked.
    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Failure of an engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying store failure, surfaced as-is.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed input (empty employee id, device id, or fingerprint).
    /// Checked before any store access.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The employee or device already has an active registration row.
    /// Translated from the SQLite unique-constraint violation; expected
    /// under concurrent registration and not fatal.
    #[error("employee or device already registered")]
    DuplicateRegistration,
}

impl EngineError {
    /// True when the SQLite failure wrapped by `err` is a unique-constraint
    /// violation that should surface as [`EngineError::DuplicateRegistration`].
    pub(crate) fn is_constraint_violation(err: &StoreError) -> bool {
        matches!(
            err,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
