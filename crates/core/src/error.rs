//! Error types for connection and transaction propagation
//!
//! ## Taxonomy
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | NoConnection | `MANDATORY` connection requested without an ambient connection |
//! | NoTransaction | `MANDATORY` transaction requested without an ambient transaction |
//! | ExistingTransaction | `NEVER` requested inside an ambient transaction |
//! | Connection | open/setup/close of the raw resource failed |
//! | TransactionSystem | begin/commit/rollback/savepoint hook failed |
//! | UnexpectedRollback | a commit was turned into a rollback by global rollback-only |
//! | IllegalTransactionState | status reused after completion, incompatible participation |
//! | NestedTransactionNotSupported | savepoint hooks not implemented |
//! | IllegalState | suspension the manager cannot perform, or a panicking synchronization |
//! | Configuration | configuration could not be read or parsed |
//! | Application | the unit of work itself failed |
//! | Suppressed | a primary failure with cleanup failures attached |
//!
//! Decision-table violations (the first three) are raised before any
//! resource hook runs.

use thiserror::Error;
use tracing::warn;

/// Boxed error accepted from collaborators and units of work
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All propagation engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// No ambient connection for a `MANDATORY` connection scope
    #[error("no connection present: {0}")]
    NoConnection(String),

    /// No ambient transaction for a `MANDATORY` transaction scope
    #[error("no transaction present: {0}")]
    NoTransaction(String),

    /// Ambient transaction found for a `NEVER` transaction scope
    #[error("existing transaction found: {0}")]
    ExistingTransaction(String),

    /// Raw resource failure (open, setup, close)
    #[error("connection error: {message}")]
    Connection {
        /// What failed
        message: String,
        /// Underlying driver error
        #[source]
        source: Option<BoxError>,
    },

    /// Transaction hook failure (begin, commit, rollback, savepoints)
    #[error("transaction system error: {message}")]
    TransactionSystem {
        /// What failed
        message: String,
        /// Underlying driver error
        #[source]
        source: Option<BoxError>,
    },

    /// Commit was converted into a rollback
    #[error("transaction rolled back: {0}")]
    UnexpectedRollback(String),

    /// Operation not valid in the status' current state
    #[error("illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// Savepoints not supported by the transaction manager
    #[error("nested transactions not supported: {0}")]
    NestedTransactionNotSupported(String),

    /// Operation not supported by the collaborator, or a callback panicked
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Failure raised by the unit of work
    #[error("application error: {0}")]
    Application(#[source] BoxError),

    /// Primary failure with cleanup failures attached
    #[error("{primary} (+{} suppressed)", .suppressed.len())]
    Suppressed {
        /// The failure reported to the caller
        primary: Box<Error>,
        /// Failures raised while cleaning up after `primary`
        suppressed: Vec<Error>,
    },
}

/// Result type for propagation engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a unit-of-work failure
    pub fn application<E: Into<BoxError>>(error: E) -> Self {
        Error::Application(error.into())
    }

    /// Raw resource failure without a driver cause
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Raw resource failure caused by a driver error
    pub fn connection_with<E: Into<BoxError>>(message: impl Into<String>, source: E) -> Self {
        Error::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Transaction hook failure without a driver cause
    pub fn transaction_system(message: impl Into<String>) -> Self {
        Error::TransactionSystem {
            message: message.into(),
            source: None,
        }
    }

    /// Transaction hook failure caused by a driver error
    pub fn transaction_system_with<E: Into<BoxError>>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Error::TransactionSystem {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Attach a cleanup failure to this error
    ///
    /// `self` stays the primary failure.
    pub fn with_suppressed(self, other: Error) -> Self {
        match self {
            Error::Suppressed {
                primary,
                mut suppressed,
            } => {
                suppressed.push(other);
                Error::Suppressed {
                    primary,
                    suppressed,
                }
            }
            primary => Error::Suppressed {
                primary: Box::new(primary),
                suppressed: vec![other],
            },
        }
    }

    /// Fold `next` into an accumulated failure
    ///
    /// The first failure stays primary, later ones are suppressed.
    pub fn accumulate(first: Option<Error>, next: Error) -> Error {
        match first {
            Some(primary) => primary.with_suppressed(next),
            None => next,
        }
    }

    /// Combine an outcome with the outcome of the cleanup that followed it
    ///
    /// A failed outcome stays primary and the cleanup failure is attached to
    /// it. A successful outcome is replaced by the cleanup failure.
    pub fn merge_cleanup<R>(outcome: Result<R>, cleanup: Result<()>) -> Result<R> {
        match (outcome, cleanup) {
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(primary), Err(cleanup)) => {
                warn!(error = %cleanup, primary = %primary, "cleanup failed after an earlier failure");
                Err(primary.with_suppressed(cleanup))
            }
        }
    }

    /// The failure reported to the caller
    pub fn primary(&self) -> &Error {
        match self {
            Error::Suppressed { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Cleanup failures attached to the primary failure
    pub fn suppressed(&self) -> &[Error] {
        match self {
            Error::Suppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Check if this is a propagation decision-table violation.
    pub fn is_propagation_violation(&self) -> bool {
        matches!(
            self.primary(),
            Error::NoConnection(_) | Error::NoTransaction(_) | Error::ExistingTransaction(_)
        )
    }

    /// Check if a commit was converted into a rollback.
    pub fn is_unexpected_rollback(&self) -> bool {
        matches!(self.primary(), Error::UnexpectedRollback(_))
    }

    /// Check if this is a unit-of-work failure.
    pub fn is_application(&self) -> bool {
        matches!(self.primary(), Error::Application(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}
