//! Property Tests
//!
//! Resource accounting over arbitrary nesting shapes.

use crate::common::*;
use proptest::prelude::*;

/// One unit of work and the scopes it opens while running
#[derive(Debug, Clone)]
struct Call {
    propagation: Propagation,
    fails: bool,
    children: Vec<Call>,
}

fn propagation() -> impl Strategy<Value = Propagation> {
    prop_oneof![
        Just(Propagation::Required),
        Just(Propagation::Supports),
        Just(Propagation::Mandatory),
        Just(Propagation::RequiresNew),
        Just(Propagation::NotSupported),
        Just(Propagation::Never),
        Just(Propagation::Nested),
    ]
}

fn call() -> impl Strategy<Value = Call> {
    let leaf = (propagation(), any::<bool>()).prop_map(|(propagation, fails)| Call {
        propagation,
        fails,
        children: Vec::new(),
    });
    leaf.prop_recursive(4, 24, 3, |inner| {
        (propagation(), any::<bool>(), prop::collection::vec(inner, 0..3)).prop_map(
            |(propagation, fails, children)| Call {
                propagation,
                fails,
                children,
            },
        )
    })
}

fn run(tx: &Transactions, call: &Call) -> Result<()> {
    tx.execute(&TransactionDefinition::of(call.propagation), |_| {
        for child in &call.children {
            let _ = run(tx, child);
        }
        if call.fails {
            work_failed()
        } else {
            Ok(())
        }
    })
}

fn required_depth(connections: &Connections, depth: usize) -> Result<()> {
    connections.execute(&ConnectionDefinition::required(), |_| {
        if depth == 0 {
            Ok(())
        } else {
            required_depth(connections, depth - 1)
        }
    })
}

proptest! {
    #[test]
    fn every_opened_resource_is_released(calls in prop::collection::vec(call(), 1..4)) {
        let engine = TestEngine::new();
        for call in &calls {
            let _ = run(&engine.transactions, call);
        }

        let driver = &engine.driver;
        prop_assert_eq!(driver.count("open"), driver.count("close"));
        prop_assert_eq!(driver.count("begin"), driver.count("commit") + driver.count("rollback"));
        prop_assert!(engine.transactions.find_transaction_status().is_none());
        prop_assert!(engine.connections.find_connection_status().is_none());
    }

    #[test]
    fn required_opens_once_per_outermost_call(depths in prop::collection::vec(0usize..8, 1..10)) {
        let engine = TestEngine::new();
        for depth in &depths {
            required_depth(&engine.connections, *depth).unwrap();
        }
        prop_assert_eq!(engine.driver.count("open"), depths.len());
        prop_assert_eq!(engine.driver.count("close"), depths.len());
    }
}
