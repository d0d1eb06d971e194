//! Synchronization Tests
//!
//! Callback ordering on connection and transaction scopes.

use crate::common::*;
use parking_lot::Mutex;

fn new_log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn execution_complete_fires_in_reverse_registration_order() {
    let engine = TestEngine::new();
    let log = new_log();

    engine
        .connections
        .execute(&ConnectionDefinition::required(), |status| {
            for name in ["A", "B", "C"] {
                status.register_synchronization(Recorder::new(name, &log));
            }
            Ok(())
        })
        .unwrap();

    let log = log.lock();
    let completed: Vec<&str> = log
        .iter()
        .filter(|e| e.ends_with(".execution_complete"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        completed,
        vec!["C.execution_complete", "B.execution_complete", "A.execution_complete"]
    );
}

#[test]
fn close_callbacks_fire_only_for_owning_scope() {
    let engine = TestEngine::new();
    let connections = &engine.connections;
    let log = new_log();

    connections
        .execute(&ConnectionDefinition::required(), |outer| {
            outer.register_synchronization(Recorder::new("outer", &log));
            connections.execute(&ConnectionDefinition::required(), |inner| {
                inner.register_synchronization(Recorder::new("inner", &log));
                Ok(())
            })?;
            assert_eq!(*log.lock(), vec!["inner.execution_complete"]);
            Ok(())
        })
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "inner.execution_complete",
            "outer.execution_complete",
            "outer.before_closed",
            "outer.after_closed",
        ]
    );
}

#[test]
fn complete_twice_fires_after_closed_once() {
    let engine = TestEngine::new();
    let log = new_log();

    let status = engine
        .connections
        .get_connection(&ConnectionDefinition::required())
        .unwrap();
    status.register_synchronization(Recorder::new("A", &log));

    engine.connections.complete(&status).unwrap();
    engine.connections.complete(&status).unwrap();

    let after_closed = log.lock().iter().filter(|e| e.ends_with(".after_closed")).count();
    assert_eq!(after_closed, 1);
}

#[test]
fn transaction_callbacks_follow_commit() {
    let engine = TestEngine::new();
    let log = new_log();

    engine
        .transactions
        .execute_write(|status| {
            status.register_synchronization(Recorder::new("tx", &log));
            Ok(())
        })
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["tx.before_commit", "tx.after_commit", "tx.after_completion(Committed)"]
    );
}

#[test]
fn transaction_callbacks_observe_rollback() {
    let engine = TestEngine::new();
    let log = new_log();

    let _ = engine.transactions.execute_write::<(), _>(|status| {
        status.register_synchronization(Recorder::new("tx", &log));
        work_failed()
    });

    assert_eq!(*log.lock(), vec!["tx.after_completion(RolledBack)"]);
}

#[test]
fn participant_callbacks_see_owner_outcome() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;
    let log = new_log();

    tx.execute_write(|_| {
        tx.execute_write(|inner| {
            inner.register_synchronization(Recorder::new("inner", &log));
            Ok(())
        })?;
        assert!(log.lock().is_empty());
        Ok(())
    })
    .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "inner.before_commit",
            "inner.after_commit",
            "inner.after_completion(Committed)",
        ]
    );
}

struct Exploding;

impl ConnectionSynchronization for Exploding {
    fn execution_complete(&self) -> Result<()> {
        panic!("listener failed");
    }
}

impl TransactionSynchronization for Exploding {
    fn after_completion(&self, _status: CompletionStatus) {
        panic!("listener failed");
    }
}

#[test]
fn panicking_after_completion_still_releases_scope() {
    let engine = TestEngine::new();
    let tx = &engine.transactions;

    tx.execute_write(|status| {
        status.register_synchronization(Arc::new(Exploding));
        Ok(())
    })
    .unwrap();

    assert_eq!(engine.driver.events(), vec!["open:1", "begin:1", "commit:1", "close:1"]);
    assert!(engine.connections.find_connection_status().is_none());
    assert!(tx.find_transaction_status().is_none());

    tx.execute_write(|status| {
        assert!(status.is_new_transaction());
        Ok(())
    })
    .unwrap();
    assert_eq!(engine.driver.count("close"), 2);
}

#[test]
fn panicking_execution_complete_is_reported_after_close() {
    let engine = TestEngine::new();
    let log = new_log();

    let err = engine
        .connections
        .execute(&ConnectionDefinition::required(), |status| {
            status.register_synchronization(Recorder::new("A", &log));
            status.register_synchronization(Arc::new(Exploding));
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, Error::IllegalState(_)));
    assert_eq!(engine.driver.events(), vec!["open:1", "close:1"]);
    assert_eq!(
        *log.lock(),
        vec!["A.execution_complete", "A.before_closed", "A.after_closed"]
    );
    assert!(engine.connections.find_connection_status().is_none());
}
