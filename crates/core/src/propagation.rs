//! Propagation decision tables
//!
//! Both execution models (blocking and async) make the same decisions; only
//! the way they open, close, commit and roll back differs. The decisions are
//! pure functions of the definition and the ambient status, returned as
//! exhaustive enums so every engine handles every row.
//!
//! Violations (`MANDATORY` without a scope, `NEVER` inside a transaction)
//! are reported here, before any resource hook can run.

use crate::definition::{
    ConnectionDefinition, ConnectionPropagation, Propagation, TransactionDefinition,
};
use crate::error::{Error, Result};
use crate::status::{ConnectionStatus, TransactionStatus};
use std::sync::Arc;

// ============================================================================
// Connections
// ============================================================================

/// What a connection scope does with the ambient connection
pub enum ConnectionDecision<C> {
    /// Wrap the ambient connection in a non-owning status
    Reuse(Arc<ConnectionStatus<C>>),
    /// Open a new connection; `suspended` is the ambient status hidden for
    /// the duration of the scope
    Open {
        /// Ambient status replaced by the new one, if any
        suspended: Option<Arc<ConnectionStatus<C>>>,
    },
}

/// Apply the connection decision table
///
/// | propagation | existing present | existing absent |
/// |-------------|------------------|-----------------|
/// | REQUIRED | reuse | open |
/// | MANDATORY | reuse | `NoConnection` |
/// | REQUIRES_NEW | suspend, open | open |
pub fn decide_connection<C>(
    definition: &ConnectionDefinition,
    existing: Option<Arc<ConnectionStatus<C>>>,
) -> Result<ConnectionDecision<C>> {
    match (definition.propagation(), existing) {
        (ConnectionPropagation::Required, Some(existing))
        | (ConnectionPropagation::Mandatory, Some(existing)) => {
            Ok(ConnectionDecision::Reuse(existing))
        }
        (ConnectionPropagation::Required, None) => Ok(ConnectionDecision::Open { suspended: None }),
        (ConnectionPropagation::Mandatory, None) => Err(Error::NoConnection(
            "no existing connection found for connection marked with propagation 'MANDATORY'"
                .to_string(),
        )),
        (ConnectionPropagation::RequiresNew, existing) => {
            Ok(ConnectionDecision::Open { suspended: existing })
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// What a transaction scope does with the ambient transaction
pub enum TransactionDecision<C> {
    /// Participate in the ambient transaction
    Participate(Arc<TransactionStatus<C>>),
    /// Participate inside a new savepoint of the ambient transaction
    Savepoint(Arc<TransactionStatus<C>>),
    /// Begin a new transaction, suspending `suspended` if present
    Begin {
        /// Ambient transaction suspended for the scope
        suspended: Option<Arc<TransactionStatus<C>>>,
    },
    /// Run without a transaction, suspending `suspended` if present
    WithoutTransaction {
        /// Ambient transaction suspended for the scope
        suspended: Option<Arc<TransactionStatus<C>>>,
    },
}

impl<C> TransactionDecision<C> {
    /// The ambient transaction this decision suspends
    pub fn suspended(&self) -> Option<&Arc<TransactionStatus<C>>> {
        match self {
            TransactionDecision::Begin { suspended }
            | TransactionDecision::WithoutTransaction { suspended } => suspended.as_ref(),
            TransactionDecision::Participate(_) | TransactionDecision::Savepoint(_) => None,
        }
    }

    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            TransactionDecision::Participate(_) => "participate",
            TransactionDecision::Savepoint(_) => "savepoint",
            TransactionDecision::Begin { suspended: None } => "begin",
            TransactionDecision::Begin { .. } => "suspend+begin",
            TransactionDecision::WithoutTransaction { suspended: None } => "no-transaction",
            TransactionDecision::WithoutTransaction { .. } => "suspend+no-transaction",
        }
    }
}

/// Apply the transaction decision table
///
/// `existing` must already exclude ambient statuses running without a
/// transaction. `savepoints` tells whether `NESTED` may use a savepoint;
/// otherwise it behaves as `REQUIRED`.
///
/// | propagation | existing tx | no existing tx |
/// |-------------|-------------|----------------|
/// | REQUIRED | participate | begin |
/// | MANDATORY | participate | `NoTransaction` |
/// | REQUIRES_NEW | suspend, begin | begin |
/// | SUPPORTS | participate | no transaction |
/// | NOT_SUPPORTED | suspend, no transaction | no transaction |
/// | NEVER | `ExistingTransaction` | no transaction |
/// | NESTED | savepoint or participate | begin |
pub fn decide_transaction<C>(
    definition: &TransactionDefinition,
    existing: Option<Arc<TransactionStatus<C>>>,
    savepoints: bool,
) -> Result<TransactionDecision<C>> {
    use TransactionDecision::*;

    let decision = match (definition.propagation(), existing) {
        (Propagation::Required, Some(existing))
        | (Propagation::Supports, Some(existing))
        | (Propagation::Mandatory, Some(existing)) => Participate(existing),
        (Propagation::Nested, Some(existing)) if savepoints => Savepoint(existing),
        (Propagation::Nested, Some(existing)) => Participate(existing),
        (Propagation::RequiresNew, existing) => Begin {
            suspended: existing,
        },
        (Propagation::NotSupported, existing) => WithoutTransaction {
            suspended: existing,
        },
        (Propagation::Never, Some(_)) => {
            return Err(Error::ExistingTransaction(
                "existing transaction found for transaction marked with propagation 'NEVER'"
                    .to_string(),
            ))
        }
        (Propagation::Mandatory, None) => {
            return Err(Error::NoTransaction(
                "no existing transaction found for transaction marked with propagation 'MANDATORY'"
                    .to_string(),
            ))
        }
        (Propagation::Required, None) | (Propagation::Nested, None) => Begin { suspended: None },
        (Propagation::Supports, None) | (Propagation::Never, None) => {
            WithoutTransaction { suspended: None }
        }
    };
    Ok(decision)
}
