//! Propagation Integration Tests
//!
//! Blocking connection and transaction scopes driven through the facade.

#[path = "../common/mod.rs"]
mod common;

mod configuration;
mod properties;
mod synchronizations;
mod transaction_scopes;
