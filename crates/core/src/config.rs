//! Transaction engine configuration
//!
//! Behavioral switches of the transaction layer. Loadable from TOML:
//!
//! ```toml
//! rollback_on_commit_failure = true
//! global_rollback_on_participation_failure = true
//! validate_existing_transaction = false
//! default_timeout_secs = 30
//! ```
//!
//! Missing keys fall back to [`TransactionConfig::default`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Transaction layer options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Attempt a rollback when the commit hook fails
    pub rollback_on_commit_failure: bool,
    /// A failing participating scope marks the outer transaction rollback-only
    pub global_rollback_on_participation_failure: bool,
    /// Participating scopes fail as soon as the outer transaction is rollback-only
    pub fail_early_on_global_rollback_only: bool,
    /// Reject participation with an incompatible definition
    pub validate_existing_transaction: bool,
    /// Allow savepoint-based `NESTED` scopes
    pub nested_transaction_allowed: bool,
    /// Timeout applied when a definition has none
    pub default_timeout_secs: Option<u64>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            rollback_on_commit_failure: false,
            global_rollback_on_participation_failure: true,
            fail_early_on_global_rollback_only: false,
            validate_existing_transaction: false,
            nested_transaction_allowed: true,
            default_timeout_secs: None,
        }
    }
}

impl TransactionConfig {
    /// Strict options - validate participation, fail early, clean up after failed commits
    pub fn strict() -> Self {
        TransactionConfig {
            rollback_on_commit_failure: true,
            global_rollback_on_participation_failure: true,
            fail_early_on_global_rollback_only: true,
            validate_existing_transaction: true,
            ..Default::default()
        }
    }

    /// Lenient options - participant failures stay local to the participant
    pub fn lenient() -> Self {
        TransactionConfig {
            global_rollback_on_participation_failure: false,
            ..Default::default()
        }
    }

    /// Parse options from a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Read options from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&input)
    }

    /// Default timeout as a duration
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }
}
