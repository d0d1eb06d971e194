//! Connection and transaction status values
//!
//! A status describes one active acquisition. It is created once per scope,
//! shared through the ambient context (hence `Arc`), and discarded when the
//! owning scope completes.
//!
//! ## Ownership
//!
//! Exactly one status per raw connection has `is_new() == true`; only the
//! scope holding that status closes the connection. Every other status wraps
//! a borrowed clone of the handle.
//!
//! ## Transaction variants
//!
//! [`TransactionKind`] is a tagged union:
//!
//! - `New` - this scope began the transaction and owns commit/rollback
//! - `NoTransaction` - the scope runs without a transaction
//! - `Existing` - the scope participates in an outer transaction, optionally
//!   inside a savepoint

use crate::context::PropagatedContext;
use crate::definition::{ConnectionDefinition, TransactionDefinition};
use crate::error::{Error, Result};
use crate::synchronization::{
    ConnectionSynchronization, SynchronizationRegistry, TransactionSynchronization,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// ConnectionStatus
// ============================================================================

/// One active connection acquisition
pub struct ConnectionStatus<C> {
    connection: C,
    definition: ConnectionDefinition,
    new_connection: bool,
    synchronizations: SynchronizationRegistry<dyn ConnectionSynchronization>,
    completed: AtomicBool,
}

impl<C> ConnectionStatus<C> {
    /// Create a status for `connection`
    ///
    /// `new_connection` marks the owning scope.
    pub fn new(connection: C, definition: ConnectionDefinition, new_connection: bool) -> Self {
        Self {
            connection,
            definition,
            new_connection,
            synchronizations: SynchronizationRegistry::new(),
            completed: AtomicBool::new(false),
        }
    }

    /// The raw connection handle
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Definition the connection was acquired with
    pub fn definition(&self) -> &ConnectionDefinition {
        &self.definition
    }

    /// Check if this scope opened (and will close) the connection
    pub fn is_new(&self) -> bool {
        self.new_connection
    }

    /// Attach a synchronization to this status
    pub fn register_synchronization(&self, sync: Arc<dyn ConnectionSynchronization>) {
        self.synchronizations.register(sync.order(), sync);
    }

    /// Registered synchronizations
    pub fn synchronizations(&self) -> &SynchronizationRegistry<dyn ConnectionSynchronization> {
        &self.synchronizations
    }

    /// Check if completion already ran
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Claim the completion of this status
    ///
    /// Returns `true` exactly once; later calls return `false`.
    pub fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }
}

impl<C> fmt::Debug for ConnectionStatus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStatus")
            .field("definition", &self.definition)
            .field("new", &self.new_connection)
            .field("synchronizations", &self.synchronizations.len())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Synchronization rebinding a thread context when a scope completes
///
/// Used by scopes that are not lexical: registered first (lowest order), so
/// it fires last among `execution_complete` callbacks.
pub struct RestoreContext {
    previous: Mutex<Option<PropagatedContext>>,
}

impl RestoreContext {
    /// Remember `previous` for restoration
    pub fn new(previous: PropagatedContext) -> Arc<Self> {
        Arc::new(Self {
            previous: Mutex::new(Some(previous)),
        })
    }
}

impl ConnectionSynchronization for RestoreContext {
    fn order(&self) -> i32 {
        i32::MIN
    }

    fn execution_complete(&self) -> Result<()> {
        if let Some(previous) = self.previous.lock().take() {
            PropagatedContext::replace_current(previous);
        }
        Ok(())
    }
}

// ============================================================================
// Savepoint
// ============================================================================

/// Savepoint marker inside an open transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    name: String,
    depth: usize,
}

impl Savepoint {
    /// Create a savepoint, validating its name
    ///
    /// Names are SQL identifiers: ASCII letters, digits and underscores, not
    /// starting with a digit, at most 63 bytes.
    pub fn new(name: impl Into<String>, depth: usize) -> Result<Self> {
        let name = name.into();
        validate_savepoint_name(&name)?;
        Ok(Self { name, depth })
    }

    /// Savepoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nesting depth, starting at 1
    pub fn depth(&self) -> usize {
        self.depth
    }
}

fn validate_savepoint_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::IllegalTransactionState(format!(
            "invalid savepoint name '{}'",
            name
        )))
    }
}

// ============================================================================
// TransactionStatus
// ============================================================================

/// Identity of an underlying transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TransactionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Lifecycle variant of a transaction status
pub enum TransactionKind<C> {
    /// This scope began the transaction
    New {
        /// Underlying transaction identity
        id: TransactionId,
        /// Set by participants; converts the owner's commit into a rollback
        global_rollback_only: AtomicBool,
        /// Savepoints created so far, used to name the next one
        savepoint_counter: AtomicUsize,
        /// Commit/rollback deadline derived from the timeout
        deadline: Option<Instant>,
    },
    /// The scope runs without a transaction
    NoTransaction,
    /// The scope participates in an outer transaction
    Existing {
        /// The status that began the transaction (always a `New` status)
        owner: Arc<TransactionStatus<C>>,
        /// Savepoint guarding this scope, for `NESTED`
        savepoint: Option<Savepoint>,
    },
}

/// Transaction suspended by a scope, restored when that scope completes
pub struct SuspendedScope<C> {
    /// The ambient status that was suspended, if any
    pub transaction: Option<Arc<TransactionStatus<C>>>,
    /// Thread context to rebind on completion (blocking engines only)
    pub context: Option<PropagatedContext>,
}

/// One active transaction scope
pub struct TransactionStatus<C> {
    connection: Arc<ConnectionStatus<C>>,
    definition: TransactionDefinition,
    kind: TransactionKind<C>,
    local_rollback_only: AtomicBool,
    completed: AtomicBool,
    synchronizations: SynchronizationRegistry<dyn TransactionSynchronization>,
    suspended: Mutex<Option<SuspendedScope<C>>>,
}

impl<C> TransactionStatus<C> {
    fn with_kind(
        connection: Arc<ConnectionStatus<C>>,
        definition: TransactionDefinition,
        kind: TransactionKind<C>,
    ) -> Self {
        Self {
            connection,
            definition,
            kind,
            local_rollback_only: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            synchronizations: SynchronizationRegistry::new(),
            suspended: Mutex::new(None),
        }
    }

    /// Status for a transaction begun by this scope
    ///
    /// `timeout` is the effective timeout (definition or configured default).
    /// A timeout too large to place on the clock means no deadline.
    pub fn new_transaction(
        connection: Arc<ConnectionStatus<C>>,
        definition: TransactionDefinition,
        timeout: Option<Duration>,
    ) -> Self {
        let kind = TransactionKind::New {
            id: TransactionId::next(),
            global_rollback_only: AtomicBool::new(false),
            savepoint_counter: AtomicUsize::new(0),
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
        };
        Self::with_kind(connection, definition, kind)
    }

    /// Status for a scope running without a transaction
    pub fn no_transaction(
        connection: Arc<ConnectionStatus<C>>,
        definition: TransactionDefinition,
    ) -> Self {
        Self::with_kind(connection, definition, TransactionKind::NoTransaction)
    }

    /// Status for a scope participating in `outer`
    ///
    /// `outer` may itself be participating; the new status always points at
    /// the owning status.
    pub fn existing(
        connection: Arc<ConnectionStatus<C>>,
        definition: TransactionDefinition,
        outer: &Arc<TransactionStatus<C>>,
        savepoint: Option<Savepoint>,
    ) -> Self {
        let kind = TransactionKind::Existing {
            owner: outer.owner(),
            savepoint,
        };
        Self::with_kind(connection, definition, kind)
    }

    /// Remember what this scope suspended
    pub fn with_suspended(self, suspended: SuspendedScope<C>) -> Self {
        *self.suspended.lock() = Some(suspended);
        self
    }

    /// Take what this scope suspended; `None` after the first call
    pub fn take_suspended(&self) -> Option<SuspendedScope<C>> {
        self.suspended.lock().take()
    }

    /// Lifecycle variant
    pub fn kind(&self) -> &TransactionKind<C> {
        &self.kind
    }

    /// The connection status this transaction runs on
    pub fn connection_status(&self) -> &Arc<ConnectionStatus<C>> {
        &self.connection
    }

    /// The raw connection handle
    pub fn connection(&self) -> &C {
        self.connection.connection()
    }

    /// Definition the scope was opened with
    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    /// Check if this scope began the transaction
    pub fn is_new_transaction(&self) -> bool {
        matches!(self.kind, TransactionKind::New { .. })
    }

    /// Check if an actual transaction is active for this scope
    pub fn has_transaction(&self) -> bool {
        !matches!(self.kind, TransactionKind::NoTransaction)
    }

    /// Check if this scope is guarded by a savepoint
    pub fn has_savepoint(&self) -> bool {
        matches!(
            self.kind,
            TransactionKind::Existing {
                savepoint: Some(_),
                ..
            }
        )
    }

    /// Savepoint guarding this scope
    pub fn savepoint(&self) -> Option<&Savepoint> {
        match &self.kind {
            TransactionKind::Existing { savepoint, .. } => savepoint.as_ref(),
            _ => None,
        }
    }

    /// Identity of the underlying transaction
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match &self.kind {
            TransactionKind::New { id, .. } => Some(*id),
            TransactionKind::NoTransaction => None,
            TransactionKind::Existing { owner, .. } => owner.transaction_id(),
        }
    }

    /// Commit/rollback deadline of the underlying transaction
    pub fn deadline(&self) -> Option<Instant> {
        match &self.kind {
            TransactionKind::New { deadline, .. } => *deadline,
            TransactionKind::NoTransaction => None,
            TransactionKind::Existing { owner, .. } => owner.deadline(),
        }
    }

    /// Time left before the deadline; `None` without a timeout
    pub fn time_to_live(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Next savepoint name for a scope nested in this transaction
    pub fn next_savepoint(self: &Arc<Self>) -> Result<Savepoint> {
        let owner = self.owner();
        match &owner.kind {
            TransactionKind::New {
                savepoint_counter, ..
            } => {
                let depth = savepoint_counter.fetch_add(1, Ordering::AcqRel) + 1;
                Savepoint::new(format!("SAVEPOINT_{}", depth), depth)
            }
            _ => Err(Error::IllegalTransactionState(
                "savepoints require an active transaction".to_string(),
            )),
        }
    }

    /// The status that began the transaction
    ///
    /// `self` for `New` and `NoTransaction` statuses.
    pub fn owner(self: &Arc<Self>) -> Arc<Self> {
        match &self.kind {
            TransactionKind::Existing { owner, .. } => Arc::clone(owner),
            _ => Arc::clone(self),
        }
    }

    // ------------------------------------------------------------------------
    // Rollback-only
    // ------------------------------------------------------------------------

    /// Mark the scope rollback-only
    ///
    /// A participating scope without a savepoint escalates to the owning
    /// transaction, so its eventual commit becomes a rollback.
    pub fn set_rollback_only(&self) {
        self.local_rollback_only.store(true, Ordering::Release);
        if let TransactionKind::Existing {
            owner,
            savepoint: None,
        } = &self.kind
        {
            owner.set_global_rollback_only();
        }
    }

    /// Mark the underlying transaction rollback-only
    pub fn set_global_rollback_only(&self) {
        match &self.kind {
            TransactionKind::New {
                global_rollback_only,
                ..
            } => global_rollback_only.store(true, Ordering::Release),
            TransactionKind::NoTransaction => {
                self.local_rollback_only.store(true, Ordering::Release)
            }
            TransactionKind::Existing { owner, .. } => owner.set_global_rollback_only(),
        }
    }

    /// Check if this scope was marked rollback-only
    pub fn is_local_rollback_only(&self) -> bool {
        self.local_rollback_only.load(Ordering::Acquire)
    }

    /// Check if the underlying transaction was marked rollback-only
    pub fn is_global_rollback_only(&self) -> bool {
        match &self.kind {
            TransactionKind::New {
                global_rollback_only,
                ..
            } => global_rollback_only.load(Ordering::Acquire),
            TransactionKind::NoTransaction => false,
            TransactionKind::Existing { owner, .. } => owner.is_global_rollback_only(),
        }
    }

    /// Check if either flag is set
    pub fn is_rollback_only(&self) -> bool {
        self.is_local_rollback_only() || self.is_global_rollback_only()
    }

    // ------------------------------------------------------------------------
    // Completion & synchronizations
    // ------------------------------------------------------------------------

    /// Check if commit or rollback already ran
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Claim the completion of this status
    ///
    /// Fails with `IllegalTransactionState` when already completed.
    pub fn mark_completed(&self) -> Result<()> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalTransactionState(
                "transaction is already completed - do not call commit or rollback more than once"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Attach a synchronization
    ///
    /// Participating scopes forward to the owning transaction, so the
    /// callback observes the real commit or rollback.
    pub fn register_synchronization(&self, sync: Arc<dyn TransactionSynchronization>) {
        match &self.kind {
            TransactionKind::Existing { owner, .. } => owner.register_synchronization(sync),
            _ => self.synchronizations.register(sync.order(), sync),
        }
    }

    /// Synchronizations registered directly on this status
    pub fn synchronizations(&self) -> &SynchronizationRegistry<dyn TransactionSynchronization> {
        &self.synchronizations
    }
}

impl<C> fmt::Debug for TransactionStatus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            TransactionKind::New { .. } => "new",
            TransactionKind::NoTransaction => "no-transaction",
            TransactionKind::Existing {
                savepoint: Some(_), ..
            } => "existing+savepoint",
            TransactionKind::Existing { .. } => "existing",
        };
        f.debug_struct("TransactionStatus")
            .field("kind", &kind)
            .field("transaction", &self.transaction_id())
            .field("definition", &self.definition)
            .field("rollback_only", &self.is_rollback_only())
            .field("completed", &self.is_completed())
            .finish()
    }
}
