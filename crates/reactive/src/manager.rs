//! Collaborator contracts for async drivers
//!
//! Same hooks as the blocking contracts, returning futures. Hooks run on
//! whatever task drives the scope; once a commit or rollback hook started it
//! is never cancelled by the engine.

use async_trait::async_trait;
use conduit_core::{
    ConnectionDefinition, ConnectionStatus, Error, Result, Savepoint, TransactionStatus,
};

/// Opens and closes raw connections asynchronously
#[async_trait]
pub trait ReactiveConnectionManager: Send + Sync + 'static {
    /// Raw connection handle, cloned for borrowing scopes
    type Connection: Clone + Send + Sync + 'static;

    /// Acquire a raw connection
    async fn open_connection(&self, definition: &ConnectionDefinition)
        -> Result<Self::Connection>;

    /// Apply resource-specific policy to a newly opened connection
    async fn setup_connection(&self, _status: &ConnectionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }

    /// Release a raw connection
    async fn close_connection(&self, status: &ConnectionStatus<Self::Connection>) -> Result<()>;
}

/// Async transaction hooks on a raw connection
#[async_trait]
pub trait ReactiveTransactionManager: Send + Sync + 'static {
    /// Raw connection handle, shared with the [`ReactiveConnectionManager`]
    type Connection: Clone + Send + Sync + 'static;

    /// Begin a transaction on the status' connection
    async fn begin_transaction(&self, status: &TransactionStatus<Self::Connection>) -> Result<()>;

    /// Commit the transaction
    async fn commit_transaction(&self, status: &TransactionStatus<Self::Connection>)
        -> Result<()>;

    /// Roll back the transaction
    async fn rollback_transaction(
        &self,
        status: &TransactionStatus<Self::Connection>,
    ) -> Result<()>;

    /// Push pending work to the resource
    async fn flush(&self, _status: &TransactionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }

    /// Whether `NESTED` may use savepoints
    fn supports_savepoints(&self) -> bool {
        false
    }

    /// Create `savepoint` inside the status' transaction
    async fn create_savepoint(
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
    async fn rollback_to_savepoint(
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
    async fn release_savepoint(
        &self,
        _status: &TransactionStatus<Self::Connection>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        Err(Error::NestedTransactionNotSupported(format!(
            "cannot release savepoint '{}'",
            savepoint.name()
        )))
    }

    /// Whether an active transaction may be suspended
    fn supports_suspension(&self) -> bool {
        true
    }

    /// The transaction is being suspended
    async fn suspend_transaction(&self, _status: &TransactionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }

    /// A suspended transaction is active again
    async fn resume_transaction(&self, _status: &TransactionStatus<Self::Connection>) -> Result<()> {
        Ok(())
    }
}
