//! Core types for conduit
//!
//! This crate holds everything both execution models share:
//! - Definitions: propagation behaviors and scope definitions
//! - PropagatedContext: immutable carrier of "current scope" markers
//! - Status values for connections and transactions
//! - Synchronization callbacks and their ordered registries
//! - Decision tables mapping (definition, ambient status) to an action
//! - Error taxonomy and transaction configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod propagation;
pub mod status;
pub mod synchronization;

pub use config::TransactionConfig;
pub use context::{PropagatedContext, PropagatedScope, ScopeKey};
pub use definition::{
    ConnectionDefinition, ConnectionPropagation, IsolationLevel, Propagation,
    TransactionDefinition,
};
pub use error::{BoxError, Error, Result};
pub use propagation::{decide_connection, decide_transaction, ConnectionDecision, TransactionDecision};
pub use status::{
    ConnectionStatus, RestoreContext, Savepoint, SuspendedScope, TransactionId, TransactionKind,
    TransactionStatus,
};
pub use synchronization::{
    CompletionStatus, ConnectionSynchronization, SynchronizationRegistry,
    TransactionSynchronization,
};
