//! Transaction Scope Tests
//!
//! Decision table and commit/rollback protocol of blocking transactions.

use crate::common::*;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;

// ============================================================================
// Participation
// ============================================================================

#[test]
fn required_joins_outer_transaction() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;

    tx.execute_write(|outer| {
        tx.execute_write(|inner| {
            assert!(!inner.is_new_transaction());
            assert!(inner.has_transaction());
            assert_eq!(inner.transaction_id(), outer.transaction_id());
            assert_eq!(inner.connection(), outer.connection());
            Ok(())
        })
    })
    .unwrap();

    assert_eq!(
        engine.driver.events(),
        vec!["open:1", "begin:1", "commit:1", "close:1"]
    );
}

#[test]
fn connection_scope_inside_transaction_uses_its_connection() {
    let engine = TestEngine::new();
    engine
        .transactions
        .execute_write(|tx| {
            engine
                .connections
                .execute(&ConnectionDefinition::required(), |connection| {
                    assert!(!connection.is_new());
                    assert_eq!(connection.connection(), tx.connection());
                    Ok(())
                })
        })
        .unwrap();
    assert_eq!(engine.driver.count("open"), 1);
}

#[test]
fn participant_set_rollback_only_rolls_back_outer() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;

    let err = tx
        .execute_write(|_| {
            tx.execute_write(|inner| {
                inner.set_rollback_only();
                Ok(())
            })?;
            Ok(())
        })
        .unwrap_err();

    assert!(err.is_unexpected_rollback());
    assert_eq!(
        engine.driver.events(),
        vec!["open:1", "begin:1", "rollback:1", "close:1"]
    );
}

#[test]
fn fail_early_reports_rollback_only_at_participant() {
    let config = TransactionConfig {
        fail_early_on_global_rollback_only: true,
        ..TransactionConfig::default()
    };
    let engine = TestEngine::with(RecordingDriver::new(), config);
    let tx = &engine.transactions;

    tx.execute_write(|outer| {
        outer.set_global_rollback_only();
        let joined = tx.execute_write(|_| Ok(()));
        assert!(joined.unwrap_err().is_unexpected_rollback());
        Ok(())
    })
    .unwrap_err();
    assert_eq!(engine.driver.count("commit"), 0);
}

// ============================================================================
// Suspension
// ============================================================================

#[test]
fn requires_new_failure_does_not_affect_outer() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;

    tx.execute_write(|outer| {
        let inner = tx.execute::<(), _>(&TransactionDefinition::of(Propagation::RequiresNew), |inner| {
            assert!(inner.is_new_transaction());
            assert_ne!(inner.connection(), outer.connection());
            work_failed()
        });
        assert!(inner.unwrap_err().is_application());

        let current = tx.find_transaction_status().unwrap();
        assert!(Arc::ptr_eq(&current, outer));
        assert!(!outer.is_rollback_only());
        Ok(())
    })
    .unwrap();

    let driver = &engine.driver;
    assert_eq!(driver.count("open"), 2);
    assert_eq!(driver.count("close"), 2);
    assert_eq!(driver.count("commit"), 1);
    assert_eq!(driver.count("rollback"), 1);
    assert_eq!(
        driver.events(),
        vec![
            "open:1", "begin:1", "open:2", "begin:2", "rollback:2", "close:2", "commit:1",
            "close:1",
        ]
    );
}

#[test]
fn not_supported_suspends_and_runs_without_transaction() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;

    tx.execute_write(|outer| {
        tx.execute(&TransactionDefinition::of(Propagation::NotSupported), |inner| {
            assert!(!inner.has_transaction());
            assert_ne!(inner.connection(), outer.connection());
            Ok(())
        })?;
        let current = tx.find_transaction_status().unwrap();
        assert!(Arc::ptr_eq(&current, outer));
        Ok(())
    })
    .unwrap();

    assert_eq!(engine.driver.count("begin"), 1);
    assert_eq!(engine.driver.count("close"), 2);
}

#[test]
fn supports_without_transaction_runs_non_transactionally() {
    let engine = TestEngine::new();
    engine
        .transactions
        .execute(&TransactionDefinition::of(Propagation::Supports), |status| {
            assert!(!status.has_transaction());
            assert!(status.transaction_id().is_none());
            Ok(())
        })
        .unwrap();
    assert_eq!(engine.driver.events(), vec!["open:1", "close:1"]);
}

// ============================================================================
// NESTED
// ============================================================================

#[test]
fn nested_rollback_only_rolls_back_to_savepoint() {
    let engine = TestEngine::with(RecordingDriver::with_savepoints(), TransactionConfig::default());
    let tx = &engine.transactions;

    tx.execute_write(|_| {
        tx.execute(&TransactionDefinition::of(Propagation::Nested), |nested| {
            nested.set_rollback_only();
            Ok(())
        })
    })
    .unwrap();

    assert_eq!(
        engine.driver.events(),
        vec![
            "open:1",
            "begin:1",
            "savepoint:SAVEPOINT_1",
            "rollback_to:SAVEPOINT_1",
            "release:SAVEPOINT_1",
            "commit:1",
            "close:1",
        ]
    );
}

#[test]
fn nested_without_savepoint_support_participates() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;

    tx.execute_write(|outer| {
        tx.execute(&TransactionDefinition::of(Propagation::Nested), |nested| {
            assert!(!nested.has_savepoint());
            assert_eq!(nested.transaction_id(), outer.transaction_id());
            Ok(())
        })
    })
    .unwrap();
    assert_eq!(
        engine.driver.events(),
        vec!["open:1", "begin:1", "commit:1", "close:1"]
    );
}

// ============================================================================
// Non-callback API
// ============================================================================

#[test]
fn get_transaction_then_rollback() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;

    let status = tx.get_transaction(&TransactionDefinition::default()).unwrap();
    assert!(Arc::ptr_eq(&tx.find_transaction_status().unwrap(), &status));

    tx.rollback(&status).unwrap();
    assert!(status.is_completed());
    assert!(tx.find_transaction_status().is_none());
    assert!(engine.connections.find_connection_status().is_none());

    let err = tx.rollback(&status).unwrap_err();
    assert!(matches!(err, Error::IllegalTransactionState(_)));
    assert_eq!(
        engine.driver.events(),
        vec!["open:1", "begin:1", "rollback:1", "close:1"]
    );
}

#[test]
fn commit_failure_is_reported_and_connection_closed() {
    let engine = TestEngine::new();
    engine.driver.fail_commit.store(true, Ordering::SeqCst);

    let err = engine.transactions.execute_write(|_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::TransactionSystem { .. }));
    assert_eq!(engine.driver.count("rollback"), 0);
    assert_eq!(engine.driver.count("close"), 1);
}

#[test]
fn flush_reaches_owner_synchronizations() {
    struct Flushes(Arc<Mutex<usize>>);
    impl TransactionSynchronization for Flushes {
        fn flush(&self) -> Result<()> {
            *self.0.lock() += 1;
            Ok(())
        }
    }

    let engine = TestEngine::new();
    let tx = &engine.transactions;
    let flushed = Arc::new(Mutex::new(0));

    tx.execute_write(|outer| {
        outer.register_synchronization(Arc::new(Flushes(Arc::clone(&flushed))));
        tx.execute_write(|inner| tx.flush(inner))
    })
    .unwrap();
    assert_eq!(*flushed.lock(), 1);
}
