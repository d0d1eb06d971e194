//! Reactive Transaction Tests
//!
//! Commit/rollback protocol of async transaction scopes.

use crate::common::*;
use std::time::Duration;

#[tokio::test]
async fn requires_new_failure_leaves_outer_committing() {
    let engine = ReactiveTestEngine::new();
    let tx = &engine.transactions;

    tx.execute_write(&PropagatedContext::empty(), |outer| async move {
        let inner = tx
            .execute(
                outer.context(),
                &TransactionDefinition::of(Propagation::RequiresNew),
                |inner| async move {
                    assert!(inner.status().is_new_transaction());
                    work_failed::<()>()
                },
            )
            .await;
        assert!(inner.unwrap_err().is_application());
        assert!(!outer.status().is_rollback_only());
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    let driver = &engine.driver;
    assert_eq!(driver.count("open"), 2);
    assert_eq!(driver.count("close"), 2);
    assert_eq!(driver.count("commit"), 1);
    assert_eq!(driver.count("rollback"), 1);
}

#[tokio::test]
async fn participant_failure_marks_outer_rollback_only() {
    let engine = ReactiveTestEngine::new();
    let tx = &engine.transactions;

    let err = tx
        .execute_write(&PropagatedContext::empty(), |outer| async move {
            let joined = tx
                .execute_write(outer.context(), |_| async { work_failed::<()>() })
                .await;
            assert!(joined.is_err());
            assert!(outer.status().is_global_rollback_only());
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();

    assert!(err.is_unexpected_rollback());
    assert_eq!(
        engine.driver.events(),
        vec!["open:1", "begin:1", "rollback:1", "close:1"]
    );
}

#[tokio::test]
async fn not_supported_hides_outer_transaction() {
    let engine = ReactiveTestEngine::new();
    let tx = &engine.transactions;

    tx.execute_write(&PropagatedContext::empty(), |outer| async move {
        tx.execute(
            outer.context(),
            &TransactionDefinition::of(Propagation::NotSupported),
            |inner| async move {
                assert!(!inner.status().has_transaction());
                assert!(tx.find_transaction_status(inner.context()).is_some());
                Ok::<_, Error>(())
            },
        )
        .await?;
        let current = tx.find_transaction_status(outer.context()).unwrap();
        assert!(Arc::ptr_eq(&current, outer.status()));
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    assert_eq!(engine.driver.count("begin"), 1);
    assert_eq!(engine.driver.count("commit"), 1);
    assert_eq!(engine.driver.count("close"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_transactions_complete_independently() {
    let engine = ReactiveTestEngine::new();

    let mut handles = Vec::new();
    for fails in [false, true] {
        let tx = engine.transactions.clone();
        handles.push(tokio::spawn(async move {
            tx.execute_write(&PropagatedContext::empty(), move |_| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if fails {
                    work_failed()
                } else {
                    Ok(())
                }
            })
            .await
        }));
    }

    let results: Vec<Result<()>> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    assert!(results[0].is_ok());
    assert!(results[1].as_ref().unwrap_err().is_application());

    let driver = &engine.driver;
    assert_eq!(driver.count("open"), 2);
    assert_eq!(driver.count("commit"), 1);
    assert_eq!(driver.count("rollback"), 1);
    assert_eq!(driver.count("close"), 2);
}

#[tokio::test]
async fn aborted_transaction_rolls_back_once() {
    let engine = ReactiveTestEngine::new();
    let tx = engine.transactions.clone();

    let handle = tokio::spawn(async move {
        tx.execute_write(&PropagatedContext::empty(), |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, Error>(())
        })
        .await
    });

    while engine.driver.count("begin") == 0 {
        tokio::task::yield_now().await;
    }
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    for _ in 0..100 {
        if engine.driver.count("close") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        engine.driver.events(),
        vec!["open:1", "begin:1", "rollback:1", "close:1"]
    );
}
