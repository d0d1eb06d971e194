//! Shared test utilities for integration tests
//!
//! `RecordingDriver` implements both the blocking and the async collaborator
//! contracts over `u64` connection ids and records every hook it runs.

#![allow(dead_code)]

use async_trait::async_trait;
use conduit::Savepoint;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub use conduit::prelude::*;

// ============================================================================
// Recording driver
// ============================================================================

/// Mock collaborator recording hook calls as `"<hook>:<connection>"`
#[derive(Default)]
pub struct RecordingDriver {
    next: AtomicU64,
    events: Mutex<Vec<String>>,
    pub savepoints: bool,
    pub fail_open: AtomicBool,
    pub fail_close: AtomicBool,
    pub fail_commit: AtomicBool,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_savepoints() -> Self {
        Self {
            savepoints: true,
            ..Self::default()
        }
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, hook: &str) -> usize {
        let prefix = format!("{}:", hook);
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(&prefix))
            .count()
    }

    fn open(&self) -> Result<u64> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::connection("pool exhausted"));
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("open:{}", id));
        Ok(id)
    }

    fn close(&self, connection: u64) -> Result<()> {
        self.record(format!("close:{}", connection));
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::connection("close failed"));
        }
        Ok(())
    }

    fn commit(&self, connection: u64) -> Result<()> {
        self.record(format!("commit:{}", connection));
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::transaction_system("commit refused"));
        }
        Ok(())
    }
}

impl ConnectionManager for RecordingDriver {
    type Connection = u64;

    fn open_connection(&self, _definition: &ConnectionDefinition) -> Result<u64> {
        self.open()
    }

    fn close_connection(&self, status: &ConnectionStatus<u64>) -> Result<()> {
        self.close(*status.connection())
    }
}

impl TransactionManager for RecordingDriver {
    type Connection = u64;

    fn begin_transaction(&self, status: &TransactionStatus<u64>) -> Result<()> {
        self.record(format!("begin:{}", status.connection()));
        Ok(())
    }

    fn commit_transaction(&self, status: &TransactionStatus<u64>) -> Result<()> {
        self.commit(*status.connection())
    }

    fn rollback_transaction(&self, status: &TransactionStatus<u64>) -> Result<()> {
        self.record(format!("rollback:{}", status.connection()));
        Ok(())
    }

    fn supports_savepoints(&self) -> bool {
        self.savepoints
    }

    fn create_savepoint(&self, _status: &TransactionStatus<u64>, savepoint: &Savepoint) -> Result<()> {
        self.record(format!("savepoint:{}", savepoint.name()));
        Ok(())
    }

    fn rollback_to_savepoint(
        &self,
        _status: &TransactionStatus<u64>,
        savepoint: &Savepoint,
    ) -> Result<()> {
        self.record(format!("rollback_to:{}", savepoint.name()));
        Ok(())
    }

    fn release_savepoint(&self, _status: &TransactionStatus<u64>, savepoint: &Savepoint) -> Result<()> {
        self.record(format!("release:{}", savepoint.name()));
        Ok(())
    }
}

#[async_trait]
impl ReactiveConnectionManager for RecordingDriver {
    type Connection = u64;

    async fn open_connection(&self, _definition: &ConnectionDefinition) -> Result<u64> {
        tokio::task::yield_now().await;
        self.open()
    }

    async fn close_connection(&self, status: &ConnectionStatus<u64>) -> Result<()> {
        tokio::task::yield_now().await;
        self.close(*status.connection())
    }
}

#[async_trait]
impl ReactiveTransactionManager for RecordingDriver {
    type Connection = u64;

    async fn begin_transaction(&self, status: &TransactionStatus<u64>) -> Result<()> {
        self.record(format!("begin:{}", status.connection()));
        Ok(())
    }

    async fn commit_transaction(&self, status: &TransactionStatus<u64>) -> Result<()> {
        self.commit(*status.connection())
    }

    async fn rollback_transaction(&self, status: &TransactionStatus<u64>) -> Result<()> {
        self.record(format!("rollback:{}", status.connection()));
        Ok(())
    }
}

// ============================================================================
// Engines
// ============================================================================

pub type Connections = ConnectionOperations<Arc<RecordingDriver>>;
pub type Transactions = TransactionOperations<Arc<RecordingDriver>, Arc<RecordingDriver>>;
pub type ReactiveConnections = ReactiveConnectionOperations<RecordingDriver>;
pub type ReactiveTransactions = ReactiveTransactionOperations<RecordingDriver, RecordingDriver>;

/// Blocking connection and transaction engines over one driver
pub struct TestEngine {
    pub driver: Arc<RecordingDriver>,
    pub connections: Arc<Connections>,
    pub transactions: Transactions,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with(RecordingDriver::new(), TransactionConfig::default())
    }

    pub fn with(driver: RecordingDriver, config: TransactionConfig) -> Self {
        let driver = Arc::new(driver);
        let connections = Arc::new(ConnectionOperations::new(Arc::clone(&driver)));
        let transactions =
            TransactionOperations::new(Arc::clone(&driver), Arc::clone(&connections), config);
        Self {
            driver,
            connections,
            transactions,
        }
    }
}

/// Async connection and transaction engines over one driver
pub struct ReactiveTestEngine {
    pub driver: Arc<RecordingDriver>,
    pub connections: ReactiveConnections,
    pub transactions: ReactiveTransactions,
}

impl ReactiveTestEngine {
    pub fn new() -> Self {
        let driver = Arc::new(RecordingDriver::new());
        let connections = ReactiveConnectionOperations::new(Arc::clone(&driver));
        let transactions = ReactiveTransactionOperations::new(
            Arc::clone(&driver),
            connections.clone(),
            TransactionConfig::default(),
        );
        Self {
            driver,
            connections,
            transactions,
        }
    }
}

// ============================================================================
// Synchronizations
// ============================================================================

/// Synchronization appending `"<name>.<callback>"` to a shared log
pub struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: Arc::clone(log),
        })
    }

    fn push(&self, callback: &str) {
        self.log.lock().push(format!("{}.{}", self.name, callback));
    }
}

impl ConnectionSynchronization for Recorder {
    fn execution_complete(&self) -> Result<()> {
        self.push("execution_complete");
        Ok(())
    }

    fn before_closed(&self) -> Result<()> {
        self.push("before_closed");
        Ok(())
    }

    fn after_closed(&self) {
        self.push("after_closed");
    }
}

impl TransactionSynchronization for Recorder {
    fn before_commit(&self, _read_only: bool) -> Result<()> {
        self.push("before_commit");
        Ok(())
    }

    fn after_commit(&self) -> Result<()> {
        self.push("after_commit");
        Ok(())
    }

    fn after_completion(&self, status: CompletionStatus) {
        self.push(&format!("after_completion({:?})", status));
    }
}

/// Error raised by a failing unit of work
pub fn work_failed<R>() -> Result<R> {
    Err(Error::application("unit of work failed"))
}
