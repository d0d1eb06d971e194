//! Reactive Integration Tests
//!
//! Async scopes driven by explicit context values.

#[path = "../common/mod.rs"]
mod common;

mod transactions;
