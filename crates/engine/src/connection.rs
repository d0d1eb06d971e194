//! Blocking connection propagation
//!
//! [`ConnectionOperations`] binds the current [`ConnectionStatus`] to the
//! calling thread and applies the connection decision table on every scope.
//!
//! ## Completion sequence
//!
//! ```text
//! execution_complete syncs (reverse)       every scope
//! before_closed syncs (reverse)            owning scope only
//! ConnectionManager::close_connection      owning scope only
//! after_closed syncs (reverse)             owning scope only
//! ```
//!
//! Every stage runs even if an earlier stage failed; failures are folded into
//! one error with the first failure as primary.
//!
//! ## Non-lexical scopes
//!
//! [`get_connection`](ConnectionOperations::get_connection) publishes the
//! status and returns it; [`complete`](ConnectionOperations::complete) must
//! later be called **on the same thread**. The previous thread context is
//! restored by a synchronization registered at acquisition, so it is
//! restored whether completion is reached through `execute` or directly.

use crate::guard::UnwindGuard;
use crate::manager::ConnectionManager;
use conduit_core::{
    decide_connection, ConnectionDecision, ConnectionDefinition, ConnectionStatus, Error,
    PropagatedContext, RestoreContext, Result, ScopeKey,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection propagation engine for blocking call stacks
pub struct ConnectionOperations<M: ConnectionManager> {
    manager: M,
    key: ScopeKey,
}

impl<M: ConnectionManager> ConnectionOperations<M> {
    /// Create an engine over `manager`
    ///
    /// Every engine gets its own [`ScopeKey`], so two engines over different
    /// data sources never see each other's connections.
    pub fn new(manager: M) -> Self {
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
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Connection status bound to the calling thread, if any
    pub fn find_connection_status(&self) -> Option<Arc<ConnectionStatus<M::Connection>>> {
        PropagatedContext::current().find(self.key)
    }

    /// Run `f` inside a connection scope
    ///
    /// The scope is completed before this returns, including when `f` fails
    /// or panics. A failure of `f` is reported as the primary error; a
    /// completion failure is attached to it.
    pub fn execute<R, F>(&self, definition: &ConnectionDefinition, f: F) -> Result<R>
    where
        F: FnOnce(&Arc<ConnectionStatus<M::Connection>>) -> Result<R>,
    {
        let status = self.get_connection(definition)?;
        let guard = UnwindGuard::new(|| {
            if let Err(e) = self.complete(&status) {
                warn!(engine = %self.key, error = %e, "connection completion failed during unwind");
            }
        });
        let result = f(&status);
        guard.disarm();

        let completion = self.complete(&status);
        Error::merge_cleanup(result, completion)
    }

    /// Acquire a connection scope without running a unit of work
    ///
    /// The returned status is published on the calling thread until
    /// [`complete`](Self::complete) is called.
    pub fn get_connection(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<ConnectionStatus<M::Connection>>> {
        let previous = PropagatedContext::current();
        let existing = previous.find::<ConnectionStatus<M::Connection>>(self.key);

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
                self.open(definition)?
            }
        };

        self.publish(previous, &status);
        Ok(status)
    }

    /// Borrow `existing` for a nested scope and publish the borrowed status
    ///
    /// Used by the transaction layer when a scope participates in a
    /// transaction and must run on that transaction's connection.
    pub fn borrow_connection(
        &self,
        existing: &ConnectionStatus<M::Connection>,
        definition: &ConnectionDefinition,
    ) -> Arc<ConnectionStatus<M::Connection>> {
        let status = self.wrap_existing(existing, definition);
        self.publish(PropagatedContext::current(), &status);
        status
    }

    /// Complete a scope acquired by [`get_connection`](Self::get_connection)
    ///
    /// Idempotent: only the first call runs the completion sequence.
    pub fn complete(&self, status: &ConnectionStatus<M::Connection>) -> Result<()> {
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
            if let Err(e) = self.manager.close_connection(status) {
                warn!(engine = %self.key, error = %e, "failed to close connection");
                failure = Some(Error::accumulate(failure, e));
            }
            synchronizations.trigger_after_closed();
        }

        failure.map_or(Ok(()), Err)
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

    fn open(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<ConnectionStatus<M::Connection>>> {
        let connection = self.manager.open_connection(definition)?;
        let status = Arc::new(ConnectionStatus::new(connection, definition.clone(), true));
        debug!(
            engine = %self.key,
            propagation = %definition.propagation(),
            new = true,
            "opened connection"
        );

        if let Err(e) = self.manager.setup_connection(&status) {
            status.mark_completed();
            return Error::merge_cleanup(Err(e), self.manager.close_connection(&status));
        }
        Ok(status)
    }

    fn publish(&self, previous: PropagatedContext, status: &Arc<ConnectionStatus<M::Connection>>) {
        status.register_synchronization(RestoreContext::new(previous.clone()));
        PropagatedContext::replace_current(previous.plus(self.key, Arc::clone(status)));
    }
}
