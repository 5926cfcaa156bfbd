use std::time::Duration;

use thiserror::Error;

use crate::db::ConfigError;

/// Commit-time isolation violation detected against a concurrent transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum Conflict {
    /// The committing transaction modified something a concurrent transaction deleted.
    #[error("transaction modified data that a concurrent transaction deleted")]
    ModifyDelete,
    /// The committing transaction deleted something a concurrent transaction modified.
    #[error("transaction deleted data that a concurrent transaction modified")]
    DeleteModify,
    /// Both transactions exclusively wrote the same key: created the same exclusively
    /// owned entity, or deleted the same thing.
    #[error("transaction exclusively wrote data that a concurrent transaction also exclusively wrote")]
    ExclusiveCreate,
}

/// Errors raised by the umbra engine.
#[derive(Error, Debug)]
pub enum UmbraError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Commit aborted by an isolation violation. The transaction stays abortable.
    #[error("isolation violation: {0}")]
    Isolation(#[from] Conflict),
    /// The statistics corrector did not stop within its shutdown budget.
    #[error("statistics corrector failed to shut down within {0:?}")]
    CorrectorShutdownTimeout(Duration),
    /// A resource was used after it had been intentionally closed.
    #[error("resource closed: {0}")]
    ResourceClosed(&'static str),
    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,
    /// The schema lock could not be acquired in time.
    #[error("timed out acquiring the schema lock after {0:?}")]
    SchemaLockTimeout(Duration),
    /// The store was written by an incompatible encoding version.
    #[error("incompatible encoding version {found}, expected {expected}")]
    IncompatibleEncoding {
        /// Version found in the store.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
    /// Opening a store that was never initialised.
    #[error("store has not been initialised")]
    NotInitialised,
    /// Creating a database over a store that already holds one.
    #[error("store is already initialised")]
    AlreadyInitialised,
    /// Persisted bytes could not be decoded.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Invalid argument or call sequence.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl UmbraError {
    /// Returns the isolation conflict carried by this error, if any.
    pub fn conflict(&self) -> Option<Conflict> {
        match self {
            UmbraError::Isolation(conflict) => Some(*conflict),
            _ => None,
        }
    }

    /// Whether this failure is the expected outcome of racing an intentional close.
    pub fn is_benign_close(&self) -> bool {
        matches!(self, UmbraError::ResourceClosed(_) | UmbraError::DatabaseClosed)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UmbraError>;
