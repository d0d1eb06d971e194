//! Async propagation engines for conduit
//!
//! The reactive engines make the same propagation decisions as the blocking
//! ones in `conduit-engine`, but the current scope travels with the pipeline
//! as an explicit [`PropagatedContext`](conduit_core::PropagatedContext)
//! instead of thread state:
//!
//! - every scope takes the caller's context and hands a refined one to its
//!   unit of work
//! - the caller's context is never modified, so concurrent pipelines built
//!   from the same context stay isolated
//! - scopes are finalized exactly once on completion, error, panic or drop
//!
//! # Example
//!
//! ```ignore
//! use conduit_core::{PropagatedContext, TransactionConfig};
//! use conduit_reactive::{ReactiveConnectionOperations, ReactiveTransactionOperations};
//!
//! let connections = ReactiveConnectionOperations::new(driver.clone());
//! let transactions =
//!     ReactiveTransactionOperations::new(driver, connections, TransactionConfig::default());
//!
//! let rows = transactions
//!     .execute_write(&PropagatedContext::empty(), |scope| async move {
//!         insert(scope.connection()).await
//!     })
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod manager;
pub mod scoped;
pub mod transaction;

pub use connection::{ConnectionScope, ReactiveConnectionOperations};
pub use manager::{ReactiveConnectionManager, ReactiveTransactionManager};
pub use scoped::{using_when, ScopeOutcome};
pub use transaction::{ReactiveTransactionOperations, TransactionScope};
