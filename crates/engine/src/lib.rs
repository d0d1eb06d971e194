//! Blocking propagation engines for conduit
//!
//! This crate implements propagation for synchronous call stacks:
//! - ConnectionOperations: reuse/open/suspend decisions for raw connections
//! - TransactionOperations: begin/participate/savepoint/suspend decisions
//!   layered on a connection engine
//! - ConnectionManager / TransactionManager: hooks a driver adapter implements
//!
//! The current scope is bound to the calling thread. Scopes nest strictly:
//! a nested scope sees the refined status of its parent, and the parent's
//! view is restored when the nested scope completes, including on panic.
//!
//! ```ignore
//! let connections = Arc::new(ConnectionOperations::new(driver.clone()));
//! let transactions = TransactionOperations::new(driver, connections, TransactionConfig::default());
//!
//! transactions.execute_write(|status| {
//!     insert_order(status.connection())?;
//!     transactions.execute(&TransactionDefinition::of(Propagation::RequiresNew), |audit| {
//!         write_audit_record(audit.connection())
//!     })
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
mod guard;
pub mod manager;
pub mod transaction;

pub use connection::ConnectionOperations;
pub use manager::{ConnectionManager, TransactionManager};
pub use transaction::TransactionOperations;
