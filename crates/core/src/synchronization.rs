//! Lifecycle synchronizations
//!
//! A synchronization is a callback attached to one status and fired at fixed
//! points of that status' lifecycle.
//!
//! ## Ordering
//!
//! Registrations are kept sorted by [`order`](ConnectionSynchronization::order)
//! (ascending), ties broken by registration order. Connection-level callbacks
//! fire in *reverse* of that order; transaction-level callbacks fire
//! *forward*:
//!
//! | Callback | Direction | Failures |
//! |----------|-----------|----------|
//! | execution_complete | reverse | accumulated, reported |
//! | before_closed | reverse | accumulated, reported |
//! | after_closed | reverse | logged, swallowed |
//! | flush / before_commit | forward | first failure aborts |
//! | before_completion | forward | logged, swallowed |
//! | after_commit | forward | accumulated, reported |
//! | after_completion | forward | logged, swallowed |
//! | suspend / resume | forward | logged, swallowed |
//!
//! A panicking callback counts as a failed one: the panic is caught and
//! handled like an error under the rule of its row, and the remaining
//! callbacks still fire.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

// ============================================================================
// Callback traits
// ============================================================================

/// Callbacks fired around the end of a connection scope
///
/// `before_closed` and `after_closed` only fire for the scope that opened the
/// connection.
pub trait ConnectionSynchronization: Send + Sync {
    /// Sort key; lower values are registered first
    fn order(&self) -> i32 {
        0
    }

    /// The unit of work finished (successfully or not)
    fn execution_complete(&self) -> Result<()> {
        Ok(())
    }

    /// The owning scope is about to close the connection
    fn before_closed(&self) -> Result<()> {
        Ok(())
    }

    /// The owning scope closed the connection
    fn after_closed(&self) {}
}

/// Outcome reported to `after_completion`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The transaction committed
    Committed,
    /// The transaction rolled back
    RolledBack,
    /// The commit hook failed and the outcome is unknown
    Unknown,
}

/// Callbacks fired around transaction completion
pub trait TransactionSynchronization: Send + Sync {
    /// Sort key; lower values fire first
    fn order(&self) -> i32 {
        0
    }

    /// The transaction is being suspended
    fn suspend(&self) {}

    /// The transaction was resumed
    fn resume(&self) {}

    /// Pending work should be flushed to the resource
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// The transaction is about to commit; a failure turns the commit into a rollback
    fn before_commit(&self, _read_only: bool) -> Result<()> {
        Ok(())
    }

    /// The transaction is about to complete
    fn before_completion(&self) {}

    /// The transaction committed
    fn after_commit(&self) -> Result<()> {
        Ok(())
    }

    /// The transaction completed with `status`
    fn after_completion(&self, _status: CompletionStatus) {}
}

// ============================================================================
// Registry
// ============================================================================

struct Registered<S: ?Sized> {
    order: i32,
    sync: Arc<S>,
}

/// Ordered list of synchronizations belonging to one status
pub struct SynchronizationRegistry<S: ?Sized> {
    entries: Mutex<Vec<Registered<S>>>,
}

impl<S: ?Sized> SynchronizationRegistry<S> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register `sync` with an explicit `order`
    ///
    /// Stable: equal orders keep registration order.
    pub fn register(&self, order: i32, sync: Arc<S>) {
        let mut entries = self.entries.lock();
        let position = entries.partition_point(|e| e.order <= order);
        entries.insert(position, Registered { order, sync });
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot in firing order for forward protocols
    pub fn forward(&self) -> Vec<Arc<S>> {
        self.entries
            .lock()
            .iter()
            .map(|e| Arc::clone(&e.sync))
            .collect()
    }

    /// Snapshot in firing order for reverse protocols
    pub fn reverse(&self) -> Vec<Arc<S>> {
        let mut snapshot = self.forward();
        snapshot.reverse();
        snapshot
    }
}

impl<S: ?Sized> Default for SynchronizationRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> fmt::Debug for SynchronizationRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizationRegistry")
            .field("len", &self.len())
            .finish()
    }
}

// Snapshots are taken before firing so callbacks may register further
// synchronizations without deadlocking; those only fire on the next protocol.

/// Run one callback, turning a panic into an error
fn fire<T>(callback: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Error::IllegalState(format!(
            "{} synchronization panicked: {}",
            callback,
            panic_message(payload.as_ref())
        ))),
    }
}

/// Run one infallible callback, logging a panic
fn fire_logged(callback: &'static str, f: impl FnOnce()) {
    let result = fire(callback, || {
        f();
        Ok(())
    });
    if let Err(e) = result {
        warn!(callback, error = %e, "synchronization failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl SynchronizationRegistry<dyn ConnectionSynchronization> {
    /// Fire `execution_complete` in reverse order, running every callback
    pub fn trigger_execution_complete(&self) -> Result<()> {
        let mut failure = None;
        for sync in self.reverse() {
            if let Err(e) = fire("execution_complete", || sync.execution_complete()) {
                failure = Some(Error::accumulate(failure, e));
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Fire `before_closed` in reverse order, running every callback
    pub fn trigger_before_closed(&self) -> Result<()> {
        let mut failure = None;
        for sync in self.reverse() {
            if let Err(e) = fire("before_closed", || sync.before_closed()) {
                failure = Some(Error::accumulate(failure, e));
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Fire `after_closed` in reverse order
    pub fn trigger_after_closed(&self) {
        for sync in self.reverse() {
            fire_logged("after_closed", || sync.after_closed());
        }
    }
}

impl SynchronizationRegistry<dyn TransactionSynchronization> {
    /// Fire `suspend` in order
    pub fn trigger_suspend(&self) {
        for sync in self.forward() {
            fire_logged("suspend", || sync.suspend());
        }
    }

    /// Fire `resume` in order
    pub fn trigger_resume(&self) {
        for sync in self.forward() {
            fire_logged("resume", || sync.resume());
        }
    }

    /// Fire `flush` in order, stopping at the first failure
    pub fn trigger_flush(&self) -> Result<()> {
        for sync in self.forward() {
            fire("flush", || sync.flush())?;
        }
        Ok(())
    }

    /// Fire `before_commit` in order, stopping at the first failure
    pub fn trigger_before_commit(&self, read_only: bool) -> Result<()> {
        for sync in self.forward() {
            fire("before_commit", || sync.before_commit(read_only))?;
        }
        Ok(())
    }

    /// Fire `before_completion` in order
    pub fn trigger_before_completion(&self) {
        for sync in self.forward() {
            fire_logged("before_completion", || sync.before_completion());
        }
    }

    /// Fire `after_commit` in order, running every callback
    pub fn trigger_after_commit(&self) -> Result<()> {
        let mut failure = None;
        for sync in self.forward() {
            if let Err(e) = fire("after_commit", || sync.after_commit()) {
                warn!(error = %e, "after_commit synchronization failed");
                failure = Some(Error::accumulate(failure, e));
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Fire `after_completion` in order
    pub fn trigger_after_completion(&self, status: CompletionStatus) {
        for sync in self.forward() {
            fire_logged("after_completion", || sync.after_completion(status));
        }
    }
}
