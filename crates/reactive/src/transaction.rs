//! Reactive transaction propagation
//!
//! Same decisions and completion protocol as the blocking transaction
//! engine, with every scope derived from an explicit [`PropagatedContext`].
//! Suspension is scoped substitution: the suspended transaction is left out
//! of the context handed to the inner unit of work, while the caller's
//! context still carries it.
//!
//! `execute` maps the scope outcome onto completion:
//!
//! | Outcome | Completion |
//! |---------|------------|
//! | Completed | commit |
//! | Failed | rollback |
//! | Cancelled | rollback |

use crate::connection::{ConnectionScope, ReactiveConnectionOperations};
use crate::manager::{ReactiveConnectionManager, ReactiveTransactionManager};
use crate::scoped::{using_when, AcquireGuard, ScopeOutcome};
use conduit_core::{
    decide_transaction, CompletionStatus, Error, PropagatedContext, Result, ScopeKey,
    SuspendedScope, TransactionConfig, TransactionDecision, TransactionDefinition, TransactionKind,
    TransactionStatus,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// An acquired transaction scope
pub struct TransactionScope<C> {
    status: Arc<TransactionStatus<C>>,
    context: PropagatedContext,
}

impl<C> TransactionScope<C> {
    /// Status of the scope
    pub fn status(&self) -> &Arc<TransactionStatus<C>> {
        &self.status
    }

    /// The raw connection handle
    pub fn connection(&self) -> &C {
        self.status.connection()
    }

    /// Context for nested scopes
    pub fn context(&self) -> &PropagatedContext {
        &self.context
    }
}

impl<C> Clone for TransactionScope<C> {
    fn clone(&self) -> Self {
        Self {
            status: Arc::clone(&self.status),
            context: self.context.clone(),
        }
    }
}

impl<C> fmt::Debug for TransactionScope<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("status", &self.status)
            .field("context", &self.context)
            .finish()
    }
}

/// Transaction propagation engine for async pipelines
pub struct ReactiveTransactionOperations<T, M>
where
    T: ReactiveTransactionManager,
    M: ReactiveConnectionManager<Connection = T::Connection>,
{
    manager: Arc<T>,
    connections: ReactiveConnectionOperations<M>,
    config: Arc<TransactionConfig>,
    key: ScopeKey,
}

impl<T, M> Clone for ReactiveTransactionOperations<T, M>
where
    T: ReactiveTransactionManager,
    M: ReactiveConnectionManager<Connection = T::Connection>,
{
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            connections: self.connections.clone(),
            config: Arc::clone(&self.config),
            key: self.key,
        }
    }
}

impl<T, M> ReactiveTransactionOperations<T, M>
where
    T: ReactiveTransactionManager,
    M: ReactiveConnectionManager<Connection = T::Connection>,
{
    /// Create an engine running its transactions on `connections`
    pub fn new(
        manager: Arc<T>,
        connections: ReactiveConnectionOperations<M>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            manager,
            connections,
            config: Arc::new(config),
            key: ScopeKey::next(),
        }
    }

    /// Identity of this engine in the propagated context
    pub fn key(&self) -> ScopeKey {
        self.key
    }

    /// The transaction hooks
    pub fn manager(&self) -> &Arc<T> {
        &self.manager
    }

    /// The connection engine transactions run on
    pub fn connections(&self) -> &ReactiveConnectionOperations<M> {
        &self.connections
    }

    /// Active configuration
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Transaction status carried by `context`, if any
    pub fn find_transaction_status(
        &self,
        context: &PropagatedContext,
    ) -> Option<Arc<TransactionStatus<T::Connection>>> {
        context.find(self.key)
    }

    /// Run `f` inside a transaction scope derived from `context`
    ///
    /// Commits when `f`'s future succeeds; rolls back when it fails, panics
    /// or is dropped.
    pub async fn execute<R, F, Fut>(
        &self,
        context: &PropagatedContext,
        definition: &TransactionDefinition,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(TransactionScope<T::Connection>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let engine = self.clone();
        using_when(
            self.get_transaction(context, definition),
            f,
            move |scope: TransactionScope<T::Connection>, outcome: ScopeOutcome| {
                async move {
                    match outcome {
                        ScopeOutcome::Completed => engine.commit(&scope.status).await,
                        ScopeOutcome::Failed | ScopeOutcome::Cancelled => {
                            debug!(engine = %engine.key, ?outcome, "rolling back transaction scope");
                            engine.rollback(&scope.status).await
                        }
                    }
                }
                .boxed()
            },
        )
        .await
    }

    /// Run `f` in a read-only `REQUIRED` transaction
    pub async fn execute_read<R, F, Fut>(&self, context: &PropagatedContext, f: F) -> Result<R>
    where
        F: FnOnce(TransactionScope<T::Connection>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.execute(context, &TransactionDefinition::read_only(), f)
            .await
    }

    /// Run `f` in a read-write `REQUIRED` transaction
    pub async fn execute_write<R, F, Fut>(&self, context: &PropagatedContext, f: F) -> Result<R>
    where
        F: FnOnce(TransactionScope<T::Connection>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.execute(context, &TransactionDefinition::default(), f)
            .await
    }

    /// Open a transaction scope derived from `context`
    ///
    /// The scope ends with [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback) on the returned status.
    pub async fn get_transaction(
        &self,
        context: &PropagatedContext,
        definition: &TransactionDefinition,
    ) -> Result<TransactionScope<T::Connection>> {
        let existing = context
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

        let (status, connection) = match decision {
            TransactionDecision::Participate(existing) => {
                self.validate_participation(definition, &existing)?;
                let connection = self.borrow_connection(context, definition, &existing);
                let status = TransactionStatus::existing(
                    Arc::clone(connection.status()),
                    definition.clone(),
                    &existing,
                    None,
                );
                (Arc::new(status), connection)
            }
            TransactionDecision::Savepoint(existing) => {
                self.validate_participation(definition, &existing)?;
                let savepoint = existing.next_savepoint()?;
                let connection = self.borrow_connection(context, definition, &existing);
                let status = TransactionStatus::existing(
                    Arc::clone(connection.status()),
                    definition.clone(),
                    &existing,
                    Some(savepoint.clone()),
                );
                debug!(engine = %self.key, savepoint = savepoint.name(), "creating savepoint");
                let pending = AcquireGuard::new(self.connections.complete_later(connection.status()));
                if let Err(e) = self.manager.create_savepoint(&status, &savepoint).await {
                    let cleanup = pending.release().await;
                    return Error::merge_cleanup(Err(e), cleanup);
                }
                pending.disarm();
                (Arc::new(status), connection)
            }
            TransactionDecision::Begin { suspended } => {
                self.open_scope(context, definition, suspended, true).await?
            }
            TransactionDecision::WithoutTransaction { suspended } => {
                self.open_scope(context, definition, suspended, false).await?
            }
        };

        Ok(TransactionScope {
            context: connection.context().plus(self.key, Arc::clone(&status)),
            status,
        })
    }

    /// Commit the scope
    ///
    /// Fails with `IllegalTransactionState` if the scope already completed.
    pub async fn commit(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        status.mark_completed()?;
        let result = match status.kind() {
            TransactionKind::New { .. } => self.commit_new(status).await,
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
                    match self.manager.rollback_to_savepoint(status, savepoint).await {
                        Ok(()) => self.manager.release_savepoint(status, savepoint).await,
                        Err(e) => Err(e),
                    }
                } else {
                    self.manager.release_savepoint(status, savepoint).await
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
        self.finish(status, result).await
    }

    /// Roll back the scope
    ///
    /// Fails with `IllegalTransactionState` if the scope already completed.
    pub async fn rollback(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        status.mark_completed()?;
        let result = match status.kind() {
            TransactionKind::New { .. } => self.rollback_new(status).await,
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
                match self.manager.rollback_to_savepoint(status, savepoint).await {
                    Ok(()) => self.manager.release_savepoint(status, savepoint).await,
                    Err(e) => Err(e),
                }
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
        self.finish(status, result).await
    }

    /// Flush pending work of the underlying transaction
    pub async fn flush(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        status.owner().synchronizations().trigger_flush()?;
        self.manager.flush(status).await
    }

    fn borrow_connection(
        &self,
        context: &PropagatedContext,
        definition: &TransactionDefinition,
        existing: &TransactionStatus<T::Connection>,
    ) -> ConnectionScope<T::Connection> {
        self.connections.borrow_connection(
            context,
            existing.connection_status(),
            &definition.connection_definition(true),
        )
    }

    /// Begin a transaction or run without one, suspending `suspended` first
    async fn open_scope(
        &self,
        context: &PropagatedContext,
        definition: &TransactionDefinition,
        suspended: Option<Arc<TransactionStatus<T::Connection>>>,
        transactional: bool,
    ) -> Result<(
        Arc<TransactionStatus<T::Connection>>,
        ConnectionScope<T::Connection>,
    )> {
        let (inner_context, pending) = match &suspended {
            Some(suspended) => {
                let pending = AcquireGuard::new(self.resume_later(suspended));
                if let Err(e) = self.suspend(suspended).await {
                    pending.disarm();
                    return Err(e);
                }
                (context.minus(self.key), pending)
            }
            None => (context.clone(), AcquireGuard::empty()),
        };
        self.acquire(&inner_context, definition, suspended, transactional, pending)
            .await
    }

    /// Open the connection and begin; `pending` undoes the suspension
    async fn acquire(
        &self,
        context: &PropagatedContext,
        definition: &TransactionDefinition,
        suspended: Option<Arc<TransactionStatus<T::Connection>>>,
        transactional: bool,
        pending: AcquireGuard,
    ) -> Result<(
        Arc<TransactionStatus<T::Connection>>,
        ConnectionScope<T::Connection>,
    )> {
        let connection = match self
            .connections
            .get_connection(
                context,
                &definition.connection_definition(suspended.is_some()),
            )
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                let resume = pending.release().await;
                return Error::merge_cleanup(Err(e), resume);
            }
        };
        let pending = pending.prepend(self.connections.complete_later(connection.status()));
        let scope = SuspendedScope {
            transaction: suspended,
            context: None,
        };

        if !transactional {
            pending.disarm();
            let status = TransactionStatus::no_transaction(
                Arc::clone(connection.status()),
                definition.clone(),
            );
            return Ok((Arc::new(status.with_suspended(scope)), connection));
        }

        let timeout = definition.timeout().or_else(|| self.config.default_timeout());
        let status = TransactionStatus::new_transaction(
            Arc::clone(connection.status()),
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
        if let Err(e) = self.manager.begin_transaction(&status).await {
            let cleanup = pending.release().await;
            return Error::merge_cleanup(Err(e), cleanup);
        }
        pending.disarm();
        Ok((Arc::new(status.with_suspended(scope)), connection))
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

    async fn suspend(&self, suspended: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        debug!(engine = %self.key, transaction = ?suspended.transaction_id(), "suspending transaction");
        let owner = suspended.owner();
        owner.synchronizations().trigger_suspend();
        if let Err(e) = self.manager.suspend_transaction(suspended).await {
            owner.synchronizations().trigger_resume();
            return Err(e);
        }
        Ok(())
    }

    async fn resume(&self, suspended: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        debug!(engine = %self.key, transaction = ?suspended.transaction_id(), "resuming transaction");
        let result = self.manager.resume_transaction(suspended).await;
        suspended.owner().synchronizations().trigger_resume();
        result
    }

    fn resume_later(
        &self,
        suspended: &Arc<TransactionStatus<T::Connection>>,
    ) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        let suspended = Arc::clone(suspended);
        async move { engine.resume(&suspended).await }.boxed()
    }

    async fn commit_new(&self, status: &Arc<TransactionStatus<T::Connection>>) -> Result<()> {
        if status.is_local_rollback_only() {
            debug!(engine = %self.key, transaction = ?status.transaction_id(), "transaction marked rollback-only, rolling back");
            return self.rollback_new(status).await;
        }
        if status.is_global_rollback_only() {
            debug!(
                engine = %self.key,
                transaction = ?status.transaction_id(),
                "transaction marked rollback-only by a participant, rolling back"
            );
            self.rollback_new(status).await?;
            return Err(Error::UnexpectedRollback(
                "transaction rolled back because it has been marked as rollback-only".to_string(),
            ));
        }

        let synchronizations = status.synchronizations();
        if let Err(e) = synchronizations.trigger_before_commit(status.definition().is_read_only()) {
            warn!(engine = %self.key, error = %e, "before_commit synchronization failed, rolling back");
            let rollback = self.rollback_new(status).await;
            return Error::merge_cleanup(Err(e), rollback);
        }

        debug!(engine = %self.key, transaction = ?status.transaction_id(), "committing transaction");
        if let Err(e) = self.manager.commit_transaction(status).await {
            error!(engine = %self.key, transaction = ?status.transaction_id(), error = %e, "commit failed");
            let mut failure = e;
            let outcome = if self.config.rollback_on_commit_failure {
                match self.manager.rollback_transaction(status).await {
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

    async fn rollback_new(&self, status: &TransactionStatus<T::Connection>) -> Result<()> {
        debug!(engine = %self.key, transaction = ?status.transaction_id(), "rolling back transaction");
        let result = self.manager.rollback_transaction(status).await;
        let synchronizations = status.synchronizations();
        synchronizations.trigger_before_completion();
        synchronizations.trigger_after_completion(match result {
            Ok(()) => CompletionStatus::RolledBack,
            Err(_) => CompletionStatus::Unknown,
        });
        result
    }

    /// Release the connection and resume what the scope suspended
    async fn finish(
        &self,
        status: &Arc<TransactionStatus<T::Connection>>,
        result: Result<()>,
    ) -> Result<()> {
        let complete = self.connections.complete(status.connection_status()).await;
        let mut result = Error::merge_cleanup(result, complete);
        if let Some(SuspendedScope {
            transaction: Some(suspended),
            ..
        }) = status.take_suspended()
        {
            let resume = self.resume(&suspended).await;
            result = Error::merge_cleanup(result, resume);
        }
        result
    }
}
