//! Blocking transaction propagation
//!
//! [`TransactionOperations`] layers the transaction decision table on top of
//! a [`ConnectionOperations`] engine. Every transaction scope first resolves
//! its connection through the connection engine (using the definition's
//! derived [`ConnectionDefinition`](conduit_core::ConnectionDefinition)),
//! then begins, joins, nests into or suspends a transaction.
//!
//! ## Commit of a new transaction
//!
//! ```text
//! local rollback-only?   -> rollback, Ok
//! global rollback-only?  -> rollback, UnexpectedRollback
//! before_commit syncs    -> failure: rollback, report failure
//! commit hook            -> failure: optional rollback, after_completion(Unknown|RolledBack)
//! after_commit syncs
//! before_completion syncs
//! after_completion(Committed)
//! complete connection, restore context, resume suspended transaction
//! ```
//!
//! Participating scopes never commit; they release or roll back their
//! savepoint, or mark the owning transaction rollback-only.

use crate::connection::ConnectionOperations;
use crate::guard::UnwindGuard;
use crate::manager::{ConnectionManager, TransactionManager};
use conduit_core::{
    decide_transaction, CompletionStatus, ConnectionStatus, Error, PropagatedContext, Result,
    ScopeKey, SuspendedScope, TransactionConfig, TransactionDecision, TransactionDefinition,
    TransactionKind, TransactionStatus,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Transaction propagation engine for blocking call stacks
pub struct TransactionOperations<T, M>
where
    T: TransactionManager,
    M: ConnectionManager<Connection = T::Connection>,
{
    manager: T,
    connections: Arc<ConnectionOperations<M>>,
    config: TransactionConfig,
    key: ScopeKey,
}

impl<T, M> TransactionOperations<T, M>
where
    T: TransactionManager,
    M: ConnectionManager<Connection = T::Connection>,
{
    /// Create an engine running its transactions on `connections`
    pub fn new(
        manager: T,
        connections: Arc<ConnectionOperations<M>>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            manager,
            connections,
            config,
            key: ScopeKey::next(),
        }
    }

    /// Identity of this engine in the propagated context
    pub fn key(&self) -> ScopeKey {
        self.key
    }

    /// The transaction hooks
    pub fn manager(&self) -> &T {
        &self.manager
    }

    /// The connection engine transactions run on
    pub fn connections(&self) -> &Arc<ConnectionOperations<M>> {
        &self.connections
    }

    /// Active configuration
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Transaction status bound to the calling thread, if any
    ///
    /// Includes scopes running without a transaction.
    pub fn find_transaction_status(&self) -> Option<Arc<TransactionStatus<T::Connection>>> {
        PropagatedContext::current().find(self.key)
    }

    // ========================================================================
    // Callback API
    // ========================================================================

    /// Run `f` inside a transaction scope
    ///
    /// Commits when `f` succeeds and rolls back when it fails or panics. A
    /// failure of `f` stays the reported error; rollback failures are
    /// attached to it.
    pub fn execute<R, F>(&self, definition: &TransactionDefinition, f: F) -> Result<R>
    where
        F: FnOnce(&Arc<TransactionStatus<T::Connection>>) -> Result<R>,
    {
        let status = self.get_transaction(definition)?;
        let guard = UnwindGuard::new(|| {
            if let Err(e) = self.rollback(&status) {
                warn!(engine = %self.key, error = %e, "rollback failed during unwind");
            }
        });
        let result = f(&status);
        guard.disarm();

        match result {
            Ok(value) => {
                self.commit(&status)?;
                Ok(value)
            }
            Err(e) => {
                debug!(engine = %self.key, error = %e, "unit of work failed, rolling back");
                Error::merge_cleanup(Err(e), self.rollback(&status))
            }
        }
    }

    /// Run `f` in a read-only `REQUIRED` transaction
    pub fn execute_read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Arc<TransactionStatus<T::Connection>>) -> Result<R>,
    {
        self.execute(&TransactionDefinition::read_only(), f)
    }

    /// Run `f` in a read-write `REQUIRED` transaction
    pub fn execute_write<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Arc<TransactionStatus<T::Connection>>) -> Result<R>,
    {
        self.execute(&TransactionDefinition::default(), f)
    }

    // ========================================================================
    // Status API
    // ========================================================================

    /// Open a transaction scope and publish it on the calling thread
    ///
    /// The scope ends with [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback), called on the same thread.
    pub fn get_transaction(
        &self,
        definition: &TransactionDefinition,
    ) -> Result<Arc<TransactionStatus<T::Connection>>> {
        let original = PropagatedContext::current();
        let existing = original
            .find::<TransactionStatus<T::Connection>>(self.key)
            .filter(|status| status.has_transaction());
        let savepoints = self.config.nested_transaction_allowed && self.manager.supports_savepoints();

        let decision = decide_transaction(definition, existing, savepoints)?;
        debug!(
            engine = %self.key,
            propagation = %definition.propagation(),
            decision = decision.label(),
            "transaction propagation"
        );
        if decision.suspended().is_some() && !self.manager.supports_suspension() {
            return Err(Error::IllegalState(format!(
                "transaction manager cannot suspend the existing transaction for propagation '{}'",
                definition.propagation()
            )));
        }

        let status = match decision {
            TransactionDecision::Participate(existing) => {
                self.participate(definition, &existing, &original)?
            }
            TransactionDecision::Savepoint(existing) => {
                self.nest(definition, &existing, &original)?
            }
            TransactionDecision::Begin { suspended } => {
                self.open_scope(definition, suspended, &original, true)?
            }
            TransactionDecision::WithoutTransaction { suspended } => {
                self.open_scope(definition, suspended, &original, false)?
            }
        };

        PropagatedContext::replace_current(
            PropagatedContext::current().plus(self.key, Arc::clone(&status)),
        );
        Ok(status)
    }

    /// Commit the scope
    ///
    /// Fails with `IllegalTransactionState` if the scope already completed.
    pub fn commit(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        status.mark_completed()?;
        let result = match status.kind() {
            TransactionKind::New { .. } => self.commit_new(status),
            TransactionKind::NoTransaction => {
                status
                    .synchronizations()
                    .trigger_after_completion(CompletionStatus::Committed);
                Ok(())
            }
            TransactionKind::Existing {
                savepoint: Some(savepoint),
                ..
            } => {
                if status.is_local_rollback_only() {
                    debug!(engine = %self.key, savepoint = savepoint.name(), "rolling back to savepoint");
                    self.manager
                        .rollback_to_savepoint(status, savepoint)
                        .and_then(|_| self.manager.release_savepoint(status, savepoint))
                } else {
                    self.manager.release_savepoint(status, savepoint)
                }
            }
            TransactionKind::Existing {
                savepoint: None, ..
            } => {
                if self.config.fail_early_on_global_rollback_only
                    && status.is_global_rollback_only()
                {
                    Err(Error::UnexpectedRollback(
                        "participating transaction found the existing transaction marked rollback-only"
                            .to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        };
        self.finish(status, result)
    }

    /// Roll back the scope
    ///
    /// Fails with `IllegalTransactionState` if the scope already completed.
    pub fn rollback(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        status.mark_completed()?;
        let result = match status.kind() {
            TransactionKind::New { .. } => self.rollback_new(status),
            TransactionKind::NoTransaction => {
                status
                    .synchronizations()
                    .trigger_after_completion(CompletionStatus::RolledBack);
                Ok(())
            }
            TransactionKind::Existing {
                savepoint: Some(savepoint),
                ..
            } => {
                debug!(engine = %self.key, savepoint = savepoint.name(), "rolling back to savepoint");
                self.manager
                    .rollback_to_savepoint(status, savepoint)
                    .and_then(|_| self.manager.release_savepoint(status, savepoint))
            }
            TransactionKind::Existing {
                savepoint: None, ..
            } => {
                if status.is_local_rollback_only()
                    || self.config.global_rollback_on_participation_failure
                {
                    debug!(
                        engine = %self.key,
                        transaction = ?status.transaction_id(),
                        "participating transaction failed, marking existing transaction rollback-only"
                    );
                    status.set_global_rollback_only();
                }
                Ok(())
            }
        };
        self.finish(status, result)
    }

    /// Flush pending work of the underlying transaction
    pub fn flush(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        status.owner().synchronizations().trigger_flush()?;
        self.manager.flush(status)
    }

    // ========================================================================
    // Scope acquisition
    // ========================================================================

    fn participate(
        &self,
        definition: &TransactionDefinition,
        existing: &Arc<TransactionStatus<T::Connection>>,
        original: &PropagatedContext,
    ) -> Result<Arc<TransactionStatus<T::Connection>>> {
        self.validate_participation(definition, existing)?;
        let connection = self.borrow_connection(definition, existing);
        let status = TransactionStatus::existing(connection, definition.clone(), existing, None);
        Ok(Arc::new(status.with_suspended(SuspendedScope {
            transaction: None,
            context: Some(original.clone()),
        })))
    }

    fn nest(
        &self,
        definition: &TransactionDefinition,
        existing: &Arc<TransactionStatus<T::Connection>>,
        original: &PropagatedContext,
    ) -> Result<Arc<TransactionStatus<T::Connection>>> {
        self.validate_participation(definition, existing)?;
        let savepoint = existing.next_savepoint()?;
        let connection = self.borrow_connection(definition, existing);
        let status = TransactionStatus::existing(
            Arc::clone(&connection),
            definition.clone(),
            existing,
            Some(savepoint.clone()),
        );

        debug!(engine = %self.key, savepoint = savepoint.name(), "creating savepoint");
        if let Err(e) = self.manager.create_savepoint(&status, &savepoint) {
            let result = Error::merge_cleanup(Err(e), self.connections.complete(&connection));
            PropagatedContext::replace_current(original.clone());
            return result;
        }
        Ok(Arc::new(status.with_suspended(SuspendedScope {
            transaction: None,
            context: Some(original.clone()),
        })))
    }

    fn borrow_connection(
        &self,
        definition: &TransactionDefinition,
        existing: &TransactionStatus<T::Connection>,
    ) -> Arc<ConnectionStatus<T::Connection>> {
        self.connections
            .borrow_connection(existing.connection_status(), &definition.connection_definition(true))
    }

    /// Begin a transaction or run without one, suspending `suspended` first
    fn open_scope(
        &self,
        definition: &TransactionDefinition,
        suspended: Option<Arc<TransactionStatus<T::Connection>>>,
        original: &PropagatedContext,
        transactional: bool,
    ) -> Result<Arc<TransactionStatus<T::Connection>>> {
        if let Some(suspended) = &suspended {
            self.suspend(suspended)?;
            PropagatedContext::replace_current(original.minus(self.key));
        }

        let scope = SuspendedScope {
            transaction: suspended.clone(),
            context: Some(original.clone()),
        };
        match self.acquire(definition, suspended.is_some(), transactional, scope) {
            Ok(status) => Ok(status),
            Err(e) => {
                PropagatedContext::replace_current(original.clone());
                match &suspended {
                    Some(suspended) => Error::merge_cleanup(Err(e), self.resume(suspended)),
                    None => Err(e),
                }
            }
        }
    }

    fn acquire(
        &self,
        definition: &TransactionDefinition,
        suspending: bool,
        transactional: bool,
        scope: SuspendedScope<T::Connection>,
    ) -> Result<Arc<TransactionStatus<T::Connection>>> {
        let connection = self
            .connections
            .get_connection(&definition.connection_definition(suspending))?;

        if !transactional {
            let status = TransactionStatus::no_transaction(connection, definition.clone());
            return Ok(Arc::new(status.with_suspended(scope)));
        }

        let timeout = definition.timeout().or_else(|| self.config.default_timeout());
        let status = TransactionStatus::new_transaction(
            Arc::clone(&connection),
            definition.clone(),
            timeout,
        );
        debug!(
            engine = %self.key,
            transaction = ?status.transaction_id(),
            isolation = ?definition.isolation(),
            read_only = definition.is_read_only(),
            "beginning transaction"
        );
        if let Err(e) = self.manager.begin_transaction(&status) {
            return Error::merge_cleanup(Err(e), self.connections.complete(&connection));
        }
        Ok(Arc::new(status.with_suspended(scope)))
    }

    fn validate_participation(
        &self,
        definition: &TransactionDefinition,
        existing: &Arc<TransactionStatus<T::Connection>>,
    ) -> Result<()> {
        if !self.config.validate_existing_transaction {
            return Ok(());
        }
        let owner = existing.owner();
        if let Some(isolation) = definition.isolation() {
            if owner.definition().isolation() != Some(isolation) {
                return Err(Error::IllegalTransactionState(format!(
                    "participating transaction specifies isolation level '{}' which is incompatible with the existing transaction",
                    isolation
                )));
            }
        }
        if !definition.is_read_only() && owner.definition().is_read_only() {
            return Err(Error::IllegalTransactionState(
                "participating transaction is not marked as read-only but the existing transaction is"
                    .to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Suspension
    // ========================================================================

    fn suspend(&self, suspended: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        debug!(engine = %self.key, transaction = ?suspended.transaction_id(), "suspending transaction");
        let owner = suspended.owner();
        owner.synchronizations().trigger_suspend();
        if let Err(e) = self.manager.suspend_transaction(suspended) {
            owner.synchronizations().trigger_resume();
            return Err(e);
        }
        Ok(())
    }

    fn resume(&self, suspended: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        debug!(engine = %self.key, transaction = ?suspended.transaction_id(), "resuming transaction");
        let result = self.manager.resume_transaction(suspended);
        suspended.owner().synchronizations().trigger_resume();
        result
    }

    // ========================================================================
    // Completion
    // ========================================================================

    fn commit_new(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        if status.is_local_rollback_only() {
            debug!(engine = %self.key, transaction = ?status.transaction_id(), "transaction marked rollback-only, rolling back");
            return self.rollback_new(status);
        }
        if status.is_global_rollback_only() {
            debug!(
                engine = %self.key,
                transaction = ?status.transaction_id(),
                "transaction marked rollback-only by a participant, rolling back"
            );
            self.rollback_new(status)?;
            return Err(Error::UnexpectedRollback(
                "transaction rolled back because it has been marked as rollback-only".to_string(),
            ));
        }

        let synchronizations = status.synchronizations();
        if let Err(e) = synchronizations.trigger_before_commit(status.definition().is_read_only()) {
            warn!(engine = %self.key, error = %e, "before_commit synchronization failed, rolling back");
            return Error::merge_cleanup(Err(e), self.rollback_new(status));
        }

        debug!(engine = %self.key, transaction = ?status.transaction_id(), "committing transaction");
        if let Err(e) = self.manager.commit_transaction(status) {
            error!(engine = %self.key, transaction = ?status.transaction_id(), error = %e, "commit failed");
            let mut failure = e;
            let outcome = if self.config.rollback_on_commit_failure {
                match self.manager.rollback_transaction(status) {
                    Ok(()) => CompletionStatus::RolledBack,
                    Err(rollback) => {
                        failure = failure.with_suppressed(rollback);
                        CompletionStatus::Unknown
                    }
                }
            } else {
                CompletionStatus::Unknown
            };
            synchronizations.trigger_before_completion();
            synchronizations.trigger_after_completion(outcome);
            return Err(failure);
        }

        let after_commit = synchronizations.trigger_after_commit();
        synchronizations.trigger_before_completion();
        synchronizations.trigger_after_completion(CompletionStatus::Committed);
        after_commit
    }

    fn rollback_new(&self, status: &TransactionStatus<T::Connection>) -> Result<()> {
        debug!(engine = %self.key, transaction = ?status.transaction_id(), "rolling back transaction");
        let result = self.manager.rollback_transaction(status);
        let synchronizations = status.synchronizations();
        synchronizations.trigger_before_completion();
        synchronizations.trigger_after_completion(match result {
            Ok(()) => CompletionStatus::RolledBack,
            Err(_) => CompletionStatus::Unknown,
        });
        result
    }

    /// Release the connection, rebind the previous context and resume what
    /// the scope suspended
    fn finish(
        &self,
        status: &Arc<TransactionStatus<T::Connection>>,
        result: Result<()>,
    ) -> Result<()> {
        let mut result = Error::merge_cleanup(
            result,
            self.connections.complete(status.connection_status()),
        );
        if let Some(scope) = status.take_suspended() {
            if let Some(context) = scope.context {
                PropagatedContext::replace_current(context);
            }
            if let Some(suspended) = scope.transaction {
                result = Error::merge_cleanup(result, self.resume(&suspended));
            }
        }
        result
    }
}
