//! Reactive connection propagation
//!
//! The current scope is a [`PropagatedContext`] value handed in by the
//! caller, never thread state. A scope refines that value for its unit of
//! work and the caller's value is left untouched, so sibling futures built
//! from the same context never observe each other's connections.
//!
//! Every `execute` future is lazy: no decision is made and no connection is
//! opened until it is polled, and each future built from the same inputs
//! makes its own acquisition.

use crate::manager::ReactiveConnectionManager;
use crate::scoped::{using_when, AcquireGuard, ScopeOutcome};
use conduit_core::{
    decide_connection, ConnectionDecision, ConnectionDefinition, ConnectionStatus, Error,
    PropagatedContext, Result, ScopeKey,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// An acquired connection scope
///
/// `context` is the refined context nested scopes must be given.
pub struct ConnectionScope<C> {
    status: Arc<ConnectionStatus<C>>,
    context: PropagatedContext,
}

impl<C> ConnectionScope<C> {
    /// Status of the scope
    pub fn status(&self) -> &Arc<ConnectionStatus<C>> {
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

impl<C> Clone for ConnectionScope<C> {
    fn clone(&self) -> Self {
        Self {
            status: Arc::clone(&self.status),
            context: self.context.clone(),
        }
    }
}

impl<C> fmt::Debug for ConnectionScope<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("status", &self.status)
            .field("context", &self.context)
            .finish()
    }
}

/// Connection propagation engine for async pipelines
pub struct ReactiveConnectionOperations<M: ReactiveConnectionManager> {
    manager: Arc<M>,
    key: ScopeKey,
}

impl<M: ReactiveConnectionManager> Clone for ReactiveConnectionOperations<M> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            key: self.key,
        }
    }
}

impl<M: ReactiveConnectionManager> ReactiveConnectionOperations<M> {
    /// Create an engine over `manager`
    pub fn new(manager: Arc<M>) -> Self {
        Self {
            manager,
            key: ScopeKey::next(),
        }
    }

    /// Identity of this engine in the propagated context
    pub fn key(&self) -> ScopeKey {
        self.key
    }

    /// The driver adapter
    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    /// Connection status carried by `context`, if any
    pub fn find_connection_status(
        &self,
        context: &PropagatedContext,
    ) -> Option<Arc<ConnectionStatus<M::Connection>>> {
        context.find(self.key)
    }

    /// Run `f` inside a connection scope derived from `context`
    ///
    /// The scope completes exactly once whether `f`'s future succeeds, fails,
    /// panics or is dropped.
    pub async fn execute<R, F, Fut>(
        &self,
        context: &PropagatedContext,
        definition: &ConnectionDefinition,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(ConnectionScope<M::Connection>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let engine = self.clone();
        using_when(
            self.get_connection(context, definition),
            f,
            move |scope: ConnectionScope<M::Connection>, outcome: ScopeOutcome| {
                async move {
                    debug!(engine = %engine.key, ?outcome, "connection scope ended");
                    engine.complete(&scope.status).await
                }
                .boxed()
            },
        )
        .await
    }

    /// Acquire a connection scope derived from `context`
    ///
    /// The caller must pass the returned status to [`complete`](Self::complete).
    pub async fn get_connection(
        &self,
        context: &PropagatedContext,
        definition: &ConnectionDefinition,
    ) -> Result<ConnectionScope<M::Connection>> {
        let existing = context.find::<ConnectionStatus<M::Connection>>(self.key);
        let status = match decide_connection(definition, existing)? {
            ConnectionDecision::Reuse(existing) => self.wrap_existing(&existing, definition),
            ConnectionDecision::Open { suspended } => {
                if suspended.is_some() {
                    debug!(
                        engine = %self.key,
                        propagation = %definition.propagation(),
                        "suspending existing connection"
                    );
                }
                self.open(definition).await?
            }
        };
        Ok(ConnectionScope {
            context: context.plus(self.key, Arc::clone(&status)),
            status,
        })
    }

    /// Borrow `existing` for a nested scope of `context`
    pub fn borrow_connection(
        &self,
        context: &PropagatedContext,
        existing: &ConnectionStatus<M::Connection>,
        definition: &ConnectionDefinition,
    ) -> ConnectionScope<M::Connection> {
        let status = self.wrap_existing(existing, definition);
        ConnectionScope {
            context: context.plus(self.key, Arc::clone(&status)),
            status,
        }
    }

    /// Complete a connection scope
    ///
    /// Idempotent: only the first call runs the completion sequence.
    pub async fn complete(&self, status: &ConnectionStatus<M::Connection>) -> Result<()> {
        if !status.mark_completed() {
            debug!(engine = %self.key, "connection scope already completed");
            return Ok(());
        }

        let synchronizations = status.synchronizations();
        let mut failure = synchronizations.trigger_execution_complete().err();

        if status.is_new() {
            if let Err(e) = synchronizations.trigger_before_closed() {
                failure = Some(Error::accumulate(failure, e));
            }
            debug!(engine = %self.key, "closing connection");
            if let Err(e) = self.manager.close_connection(status).await {
                warn!(engine = %self.key, error = %e, "failed to close connection");
                failure = Some(Error::accumulate(failure, e));
            }
            synchronizations.trigger_after_closed();
        }

        failure.map_or(Ok(()), Err)
    }

    /// Deferred [`complete`](Self::complete) of `status`
    pub(crate) fn complete_later(
        &self,
        status: &Arc<ConnectionStatus<M::Connection>>,
    ) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        let status = Arc::clone(status);
        async move { engine.complete(&status).await }.boxed()
    }

    fn wrap_existing(
        &self,
        existing: &ConnectionStatus<M::Connection>,
        definition: &ConnectionDefinition,
    ) -> Arc<ConnectionStatus<M::Connection>> {
        debug!(
            engine = %self.key,
            propagation = %definition.propagation(),
            new = false,
            "reusing existing connection"
        );
        Arc::new(ConnectionStatus::new(
            existing.connection().clone(),
            definition.clone(),
            false,
        ))
    }

    async fn open(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<ConnectionStatus<M::Connection>>> {
        let connection = self.manager.open_connection(definition).await?;
        let status = Arc::new(ConnectionStatus::new(connection, definition.clone(), true));
        debug!(
            engine = %self.key,
            propagation = %definition.propagation(),
            new = true,
            "opened connection"
        );

        let pending = AcquireGuard::new(self.complete_later(&status));
        if let Err(e) = self.manager.setup_connection(&status).await {
            let close = pending.release().await;
            return Error::merge_cleanup(Err(e), close);
        }
        pending.disarm();
        Ok(status)
    }
}
