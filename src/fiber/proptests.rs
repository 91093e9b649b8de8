//! Property-based tests for the fiber driver
//!
//! Continuations here are scripted: each activation pops the next operation
//! from the state captured in its rest, so any generated script is replayable.

use super::*;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Op {
    Wait,
    Call,
    Interrupt,
    Done,
    Fail,
}

#[derive(Debug, Default)]
struct Script {
    invocations: usize,
    faults_seen: usize,
}

// ============================================================================
// Test Helpers
// ============================================================================

fn scripted_registry() -> Registry<Script> {
    let mut registry = Registry::<Script>::new();
    registry
        .register_fn("script", TypeTag::OBJECT, |fiber, script, rest, item| {
            script.invocations += 1;
            if item.is_fault() {
                script.faults_seen += 1;
            }
            let mut ops: Vec<Op> = rest.state_as()?;
            let op = if ops.is_empty() { Op::Done } else { ops.remove(0) };
            let next = Rest::with_state("script", &ops)?;
            match op {
                Op::Wait => fiber.wait(next)?,
                Op::Call => fiber.call("child", next.clone(), Item::unit(), Some(next))?,
                Op::Interrupt => {
                    fiber.interrupt("interruption", Rest::with_state("script", &Vec::<Op>::new())?, Item::unit())?;
                    fiber.wait(next)?;
                }
                Op::Done => fiber.done(Item::unit())?,
                Op::Fail => return Err(Fault::new("script", "scripted failure")),
            }
            Ok(())
        })
        .register_fn("alpha_only", "alpha", |fiber, script, _rest, _item| {
            script.invocations += 1;
            fiber.wait(Rest::new("alpha_only"))?;
            Ok(())
        });
    registry
        .types_mut()
        .declare("alpha", TypeTag::OBJECT)
        .declare("beta", TypeTag::OBJECT);
    registry
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Wait),
        2 => Just(Op::Call),
        1 => Just(Op::Interrupt),
        2 => Just(Op::Done),
        1 => Just(Op::Fail),
    ]
}

fn arb_script() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(arb_op(), 0..7)
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// After a successful poll the stack is always stable
    #[test]
    fn poll_always_settles(ops in arb_script()) {
        let rt = runtime();
        rt.block_on(async {
            let mut fiber = Fiber::new(Arc::new(scripted_registry()));
            let mut script = Script::default();
            let token = CancellationToken::new();
            fiber
                .call("root", Rest::with_state("script", &ops).unwrap(), Item::unit(), None)
                .unwrap();

            for _ in 0..64 {
                match fiber.poll(&mut script, &token).await {
                    Ok(need) => {
                        prop_assert!(matches!(need, Need::Wait | Need::Done | Need::None));
                        prop_assert_eq!(need, fiber.need());
                        if need != Need::Wait {
                            break;
                        }
                        fiber.post(Item::unit()).unwrap();
                    }
                    Err(error) => {
                        prop_assert!(matches!(error, FiberError::Unhandled(_)));
                        prop_assert!(!fiber.is_polling());
                        break;
                    }
                }
            }
            Ok(())
        })?;
    }

    /// A completed fiber has no frames and holds a result
    #[test]
    fn done_means_empty_with_result(ops in arb_script()) {
        let rt = runtime();
        rt.block_on(async {
            let mut fiber = Fiber::new(Arc::new(scripted_registry()));
            let mut script = Script::default();
            let token = CancellationToken::new();
            fiber
                .call("root", Rest::with_state("script", &ops).unwrap(), Item::unit(), None)
                .unwrap();

            for _ in 0..64 {
                match fiber.poll(&mut script, &token).await {
                    Ok(Need::Wait) => fiber.post(Item::unit()).unwrap(),
                    Ok(Need::Done) => {
                        prop_assert_eq!(fiber.depth(), 0);
                        prop_assert!(fiber.result().is_some());
                        break;
                    }
                    _ => break,
                }
            }
            Ok(())
        })?;
    }

    /// Posting an item of the wrong type never reaches the continuation
    #[test]
    fn mismatched_posts_never_invoke(tag in "[a-z]{1,8}") {
        prop_assume!(tag != "alpha");
        let rt = runtime();
        rt.block_on(async {
            let mut fiber = Fiber::new(Arc::new(scripted_registry()));
            let mut script = Script::default();
            let token = CancellationToken::new();
            fiber
                .call("root", Rest::new("alpha_only"), Item::new("alpha", serde_json::Value::Null), None)
                .unwrap();
            fiber.poll(&mut script, &token).await.unwrap();
            let before = script.invocations;
            let snapshot = fiber.snapshot();

            let error = fiber.post(Item::new(tag.as_str(), serde_json::Value::Null)).unwrap_err();
            let is_invalid_type = matches!(error, FiberError::InvalidType { .. });
            prop_assert!(is_invalid_type);
            prop_assert_eq!(fiber.snapshot(), snapshot);
            fiber.poll(&mut script, &token).await.unwrap();
            prop_assert_eq!(script.invocations, before);
            Ok(())
        })?;
    }

    /// Snapshots survive JSON and drive to the same state as the original
    #[test]
    fn snapshots_resume_identically(ops in arb_script(), posts in 0usize..4) {
        let rt = runtime();
        rt.block_on(async {
            let registry = Arc::new(scripted_registry());
            let token = CancellationToken::new();
            let mut original = Fiber::new(Arc::clone(&registry));
            original
                .call("root", Rest::with_state("script", &ops).unwrap(), Item::unit(), None)
                .unwrap();
            let _ = original.poll(&mut Script::default(), &token).await;

            let json = serde_json::to_string(&original.snapshot()).unwrap();
            let mut restored = Fiber::restore(registry, serde_json::from_str(&json).unwrap());
            prop_assert_eq!(restored.snapshot(), original.snapshot());

            for _ in 0..posts {
                if original.need() != Need::Wait {
                    break;
                }
                original.post(Item::unit()).unwrap();
                restored.post(Item::unit()).unwrap();
                let a = original.poll(&mut Script::default(), &token).await;
                let b = restored.poll(&mut Script::default(), &token).await;
                prop_assert_eq!(a, b);
                prop_assert_eq!(restored.snapshot(), original.snapshot());
            }
            Ok(())
        })?;
    }
}
