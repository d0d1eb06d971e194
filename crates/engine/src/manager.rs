//! Collaborator contracts for blocking drivers
//!
//! The engines decide *when* a resource is opened, closed, begun, committed
//! or rolled back. A driver adapter implementing these traits decides *how*.
//!
//! One adapter usually implements both traits over the same handle type; the
//! blanket `Arc` impls let a single shared instance serve both engines.

use conduit_core::{
    ConnectionDefinition, ConnectionStatus, Error, Result, Savepoint, TransactionStatus,
};
use std::sync::Arc;

/// Opens and closes raw connections
pub trait ConnectionManager: Send + Sync {
    /// Raw connection handle
    ///
    /// Cloned when a nested scope borrows the connection, so it is usually a
    /// cheap handle (an `Arc` or a pool ticket).
    type Connection: Clone + Send + Sync + 'static;

    /// Acquire a raw connection
    fn open_connection(&self, definition: &ConnectionDefinition) -> Result<Self::Connection>;

    /// Apply resource-specific policy (read-only, timeouts) to a newly opened
    /// connection before the unit of work runs
    fn setup_connection(&self, _status: &ConnectionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }

    /// Release a raw connection opened by [`open_connection`](Self::open_connection)
    fn close_connection(&self, status: &ConnectionStatus<Self::Connection>) -> Result<()>;
}

/// Transaction hooks on a raw connection
pub trait TransactionManager: Send + Sync {
    /// Raw connection handle, shared with the [`ConnectionManager`]
    type Connection: Clone + Send + Sync + 'static;

    /// Begin a transaction on the status' connection
    ///
    /// The definition's isolation, read-only flag and the status deadline are
    /// forwarded here; the engine itself enforces none of them.
    fn begin_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()>;

    /// Commit the transaction begun by [`begin_transaction`](Self::begin_transaction)
    fn commit_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()>;

    /// Roll back the transaction begun by [`begin_transaction`](Self::begin_transaction)
    fn rollback_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()>;

    /// Push pending work to the resource
    fn flush(&self, _status: &TransactionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }

    /// Whether `NESTED` may use savepoints
    fn supports_savepoints(&self) -> bool {
        false
    }

    /// Create `savepoint` inside the status' transaction
    fn create_savepoint(
        &self,
        _status: &TransactionStatus<Self::Connection>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        Err(Error::NestedTransactionNotSupported(format!(
            "cannot create savepoint '{}'",
            savepoint.name()
        )))
    }

    /// Roll back to `savepoint`
    fn rollback_to_savepoint(
        &self,
        _status: &TransactionStatus<Self::Connection>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        Err(Error::NestedTransactionNotSupported(format!(
            "cannot roll back to savepoint '{}'",
            savepoint.name()
        )))
    }

    /// Release `savepoint`
    fn release_savepoint(
        &self,
        _status: &TransactionStatus<Self::Connection>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        Err(Error::NestedTransactionNotSupported(format!(
            "cannot release savepoint '{}'",
            savepoint.name()
        )))
    }

    /// Whether an active transaction may be suspended for `REQUIRES_NEW` and
    /// `NOT_SUPPORTED`
    fn supports_suspension(&self) -> bool {
        true
    }

    /// The transaction is being suspended
    fn suspend_transaction(&self, _status: &TransactionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }

    /// A suspended transaction is active again
    fn resume_transaction(&self, _status: &TransactionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }
}

impl<M: ConnectionManager + ?Sized> ConnectionManager for Arc<M> {
    type Connection = M::Connection;

    fn open_connection(&self, definition: &ConnectionDefinition) -> Result<Self::Connection> {
        (**self).open_connection(definition)
    }

    fn setup_connection(&self, status: &ConnectionStatus<Self::Connection>) -> Result<()> {
        (**self).setup_connection(status)
    }

    fn close_connection(&self, status: &ConnectionStatus<Self::Connection>) -> Result<()> {
        (**self).close_connection(status)
    }
}

impl<M: TransactionManager + ?Sized> TransactionManager for Arc<M> {
    type Connection = M::Connection;

    fn begin_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()> {
        (**self).begin_transaction(status)
    }

    fn commit_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()> {
        (**self).commit_transaction(status)
    }

    fn rollback_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()> {
        (**self).rollback_transaction(status)
    }

    fn flush(&self, status: &TransactionStatus<Self::Connection>) -> Result<()> {
        (**self).flush(status)
    }

    fn supports_savepoints(&self) -> bool {
        (**self).supports_savepoints()
    }

    fn create_savepoint(
        &self,
        status: &TransactionStatus<Self::Connection>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        (**self).create_savepoint(status, savepoint)
    }

    fn rollback_to_savepoint(
        &self,
        status: &TransactionStatus<Self::Connection>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        (**self).rollback_to_savepoint(status, savepoint)
    }

    fn release_savepoint(
        &self,
        status: &TransactionStatus<Self::Connection>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        (**self).release_savepoint(status, savepoint)
    }

    fn supports_suspension(&self) -> bool {
        (**self).supports_suspension()
    }

    fn suspend_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()> {
        (**self).suspend_transaction(status)
    }

    fn resume_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()> {
        (**self).resume_transaction(status)
    }
}
