//! Convenient imports for Conduit.
//!
//! ```ignore
//! use conduit::prelude::*;
//! ```

// Definitions
pub use crate::{ConnectionDefinition, IsolationLevel, Propagation, TransactionDefinition};

// Configuration and errors
pub use crate::{Error, Result, TransactionConfig};

// Status values and callbacks
pub use crate::{
    CompletionStatus, ConnectionStatus, ConnectionSynchronization, TransactionStatus,
    TransactionSynchronization,
};

// Blocking engines
pub use crate::{ConnectionManager, ConnectionOperations, TransactionManager, TransactionOperations};

// Reactive engines
pub use crate::{
    PropagatedContext, ReactiveConnectionManager, ReactiveConnectionOperations,
    ReactiveTransactionManager, ReactiveTransactionOperations,
};

pub use std::sync::Arc;
