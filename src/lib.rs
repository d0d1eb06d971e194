//! # Conduit
//!
//! Connection and transaction propagation for blocking and async data access.
//!
//! Conduit decides, for every unit of work, whether to reuse the connection
//! or transaction already in scope, open a new one, suspend the current one,
//! or fail. The decision follows the propagation behavior declared at the
//! call site, and the engine guarantees that whatever a scope opened is
//! committed or rolled back and closed exactly once.
//!
//! ## Quick Start
//!
//! ```ignore
//! use conduit::prelude::*;
//!
//! conduit::init_tracing();
//!
//! let connections = Arc::new(ConnectionOperations::new(driver.clone()));
//! let transactions =
//!     TransactionOperations::new(driver, connections, TransactionConfig::default());
//!
//! transactions.execute_write(|outer| {
//!     // Joins `outer`: same connection, same transaction
//!     transactions.execute_write(|inner| insert(inner.connection()))?;
//!
//!     // Suspends `outer` and runs on its own connection
//!     transactions.execute(&TransactionDefinition::of(Propagation::RequiresNew), |audit| {
//!         record(audit.connection())
//!     })
//! })?;
//! ```
//!
//! ## Execution models
//!
//! | Crate | Current scope | Entry point |
//! |-------|---------------|-------------|
//! | `conduit-engine` | bound to the calling thread | [`TransactionOperations`] |
//! | `conduit-reactive` | explicit [`PropagatedContext`] value | [`ReactiveTransactionOperations`] |
//!
//! Both share the definitions, status values, decision tables and error
//! taxonomy from `conduit-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod logging;

pub mod prelude;

pub use logging::init_tracing;

// Re-export core types
pub use conduit_core::{
    CompletionStatus, ConnectionDefinition, ConnectionPropagation, ConnectionStatus,
    ConnectionSynchronization, Error, IsolationLevel, PropagatedContext, Propagation, Result,
    Savepoint, TransactionConfig, TransactionDefinition, TransactionStatus,
    TransactionSynchronization,
};

// Re-export blocking engines
pub use conduit_engine::{
    ConnectionManager, ConnectionOperations, TransactionManager, TransactionOperations,
};

// Re-export reactive engines
pub use conduit_reactive::{
    ConnectionScope, ReactiveConnectionManager, ReactiveConnectionOperations,
    ReactiveTransactionManager, ReactiveTransactionOperations, TransactionScope,
};
