//! Connection and transaction definitions
//!
//! A definition is the declarative, per-call-site description of how a unit of
//! work relates to the ambient scope. Definitions are immutable once built:
//! the `with_*` methods consume and return `Self`.
//!
//! ## Propagation
//!
//! | Propagation | Existing scope | No existing scope |
//! |-------------|----------------|-------------------|
//! | Required | participate | begin new |
//! | Supports | participate | run without transaction |
//! | Mandatory | participate | fail |
//! | RequiresNew | suspend, begin new | begin new |
//! | NotSupported | suspend, run without transaction | run without transaction |
//! | Never | fail | run without transaction |
//! | Nested | savepoint (or participate) | begin new |
//!
//! Connections only know the first three rows (`Required`, `Mandatory`,
//! `RequiresNew`), see [`ConnectionPropagation`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Propagation
// ============================================================================

/// Propagation behavior of a connection scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionPropagation {
    /// Reuse the current connection, open one if none exists
    #[default]
    Required,
    /// Reuse the current connection, fail if none exists
    Mandatory,
    /// Always open a new connection, suspending the current one
    RequiresNew,
}

impl ConnectionPropagation {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPropagation::Required => "REQUIRED",
            ConnectionPropagation::Mandatory => "MANDATORY",
            ConnectionPropagation::RequiresNew => "REQUIRES_NEW",
        }
    }
}

impl fmt::Display for ConnectionPropagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Propagation behavior of a transaction scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Participate in the current transaction, begin one if none exists
    #[default]
    Required,
    /// Participate if a transaction exists, otherwise run without one
    Supports,
    /// Participate in the current transaction, fail if none exists
    Mandatory,
    /// Suspend the current transaction and always begin a new one
    RequiresNew,
    /// Suspend the current transaction and run without one
    NotSupported,
    /// Run without a transaction, fail if one exists
    Never,
    /// Run inside a savepoint of the current transaction if possible
    Nested,
}

impl Propagation {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::Supports => "SUPPORTS",
            Propagation::Mandatory => "MANDATORY",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Never => "NEVER",
            Propagation::Nested => "NESTED",
        }
    }

    /// All propagation behaviors, in declaration order
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::Supports,
        Propagation::Mandatory,
        Propagation::RequiresNew,
        Propagation::NotSupported,
        Propagation::Never,
        Propagation::Nested,
    ];
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Dirty reads allowed
    ReadUncommitted,
    /// Only committed data is visible
    ReadCommitted,
    /// Rows read once stay stable
    RepeatableRead,
    /// Full serializability
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of the isolation level
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

// ============================================================================
// ConnectionDefinition
// ============================================================================

/// Declarative description of a connection scope
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDefinition {
    propagation: ConnectionPropagation,
    name: Option<String>,
    read_only: bool,
    timeout: Option<Duration>,
}

impl ConnectionDefinition {
    /// Definition with the given propagation and defaults elsewhere
    pub fn new(propagation: ConnectionPropagation) -> Self {
        Self {
            propagation,
            ..Default::default()
        }
    }

    /// `REQUIRED` connection
    pub fn required() -> Self {
        Self::new(ConnectionPropagation::Required)
    }

    /// `MANDATORY` connection
    pub fn mandatory() -> Self {
        Self::new(ConnectionPropagation::Mandatory)
    }

    /// `REQUIRES_NEW` connection
    pub fn requires_new() -> Self {
        Self::new(ConnectionPropagation::RequiresNew)
    }

    /// Set a descriptive name, used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Mark the connection as read-only
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set a timeout, forwarded to the connection opener
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Propagation behavior
    pub fn propagation(&self) -> ConnectionPropagation {
        self.propagation
    }

    /// Optional name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the connection is read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Optional timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// ============================================================================
// TransactionDefinition
// ============================================================================

/// Declarative description of a transaction scope
///
/// Extends the connection-level settings with a full propagation table and
/// an isolation level. The underlying connection definition is derived with
/// [`TransactionDefinition::connection_definition`].
///
/// # Example
///
/// ```ignore
/// let def = TransactionDefinition::of(Propagation::RequiresNew)
///     .with_isolation(IsolationLevel::Serializable)
///     .with_timeout(Duration::from_secs(5))
///     .with_name("audit");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionDefinition {
    propagation: Propagation,
    isolation: Option<IsolationLevel>,
    timeout: Option<Duration>,
    read_only: bool,
    name: Option<String>,
}

impl TransactionDefinition {
    /// Definition with the given propagation and defaults elsewhere
    pub fn of(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Default::default()
        }
    }

    /// Read-only `REQUIRED` transaction
    pub fn read_only() -> Self {
        Self::default().with_read_only(true)
    }

    /// Set the isolation level
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Set the timeout forwarded to the begin hook
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark the transaction read-only
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set a descriptive name, used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Propagation behavior
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// Isolation level, if one was requested
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Timeout, if one was requested
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether the transaction is read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Optional name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Derive the definition of the connection this transaction runs on
    ///
    /// `existing_transaction` tells whether an ambient transaction is present.
    /// A suspending scope must never borrow the suspended transaction's
    /// connection, so `RequiresNew` (always) and `NotSupported` (when a
    /// transaction exists) ask for a fresh connection.
    pub fn connection_definition(&self, existing_transaction: bool) -> ConnectionDefinition {
        let propagation = match self.propagation {
            Propagation::RequiresNew => ConnectionPropagation::RequiresNew,
            Propagation::NotSupported if existing_transaction => {
                ConnectionPropagation::RequiresNew
            }
            Propagation::Mandatory => ConnectionPropagation::Mandatory,
            Propagation::Required
            | Propagation::Supports
            | Propagation::NotSupported
            | Propagation::Never
            | Propagation::Nested => ConnectionPropagation::Required,
        };
        ConnectionDefinition {
            propagation,
            name: self.name.clone(),
            read_only: self.read_only,
            timeout: self.timeout,
        }
    }
}
