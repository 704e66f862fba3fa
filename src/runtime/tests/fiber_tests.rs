//! Tests for fiber spawning

use std::cell::RefCell;
use std::rc::Rc;

use super::helpers::{program, run_local, test_runtime};
use crate::runtime::fiber::run_fiber_async;
use crate::runtime::frame::{self, label};
use crate::values::Value;

#[tokio::test]
async fn test_fiber_receives_args_and_resolves() {
    run_local(async {
        let entry = label(|rt, s| frame::leave(rt, s, Value::Null));
        let (rt, _rx) = test_runtime(program(entry));

        let action = rt.mk_action(
            label(|rt, s| {
                let (a, b) = {
                    let f = s.borrow();
                    (
                        f.lambda_args[0].as_num().unwrap(),
                        f.lambda_args[1].as_num().unwrap(),
                    )
                };
                frame::leave(rt, s, Value::Num(a + b))
            }),
            Vec::new(),
        );

        let result = run_fiber_async(&rt, action, vec![Value::Num(2.0), Value::Num(3.0)])
            .await
            .unwrap();
        assert_eq!(result, Value::Num(5.0));
    })
    .await;
}

#[tokio::test]
async fn test_fiber_args_capped_at_three() {
    run_local(async {
        let entry = label(|rt, s| frame::leave(rt, s, Value::Null));
        let (rt, _rx) = test_runtime(program(entry));

        let action = rt.mk_action(
            label(|rt, s| {
                let n = s.borrow().lambda_args.len();
                frame::leave(rt, s, Value::Num(n as f64))
            }),
            Vec::new(),
        );

        let args = (0..5).map(|i| Value::Num(i as f64)).collect();
        let result = run_fiber_async(&rt, action, args).await.unwrap();
        assert_eq!(result, Value::Num(3.0));
    })
    .await;
}

#[tokio::test]
async fn test_fiber_refcount_balances() {
    run_local(async {
        let entry = label(|rt, s| frame::leave(rt, s, Value::Null));
        let (rt, _rx) = test_runtime(program(entry));

        let action = rt.mk_action(
            label(|rt, s| frame::leave(rt, s, Value::Null)),
            Vec::new(),
        );
        let obj = action.ref_object().unwrap().clone();
        assert_eq!(obj.refs(), 1);

        // Spawn holds one extra reference until the fiber is dispatched
        let pending = run_fiber_async(&rt, action.clone(), vec![]);
        assert_eq!(obj.refs(), 2);

        pending.await.unwrap();
        // Let the spawning task finish its balancing decrement
        tokio::task::yield_now().await;
        assert_eq!(obj.refs(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_dead_runtime_spawns_nothing() {
    run_local(async {
        let entry = label(|rt, s| frame::leave(rt, s, Value::Null));
        let (rt, _rx) = test_runtime(program(entry));
        rt.kill();

        let ran = Rc::new(RefCell::new(false));
        let action = {
            let ran = ran.clone();
            rt.mk_action(
                label(move |rt, s| {
                    *ran.borrow_mut() = true;
                    frame::leave(rt, s, Value::Null)
                }),
                Vec::new(),
            )
        };

        let result = run_fiber_async(&rt, action, vec![]).await;
        assert!(result.is_err(), "sentinel must not fire after kill");
        assert!(!*ran.borrow());
    })
    .await;
}

#[tokio::test]
async fn test_fibers_interleave_only_at_suspension_points() {
    run_local(async {
        // Two fibers appending to a shared log; each runs to its pause
        // before the other starts, then they alternate.
        let entry = label(|rt, s| frame::leave(rt, s, Value::Null));
        let (rt, _rx) = test_runtime(program(entry));

        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let mk = |tag: &'static str, log: Rc<RefCell<Vec<String>>>| {
            label(move |rt, s| {
                let pc = s.borrow().pc;
                match pc {
                    0 => {
                        log.borrow_mut().push(format!("{tag}:start"));
                        crate::runtime::scheduler::thread_pause(rt, s, 1, 0)
                    }
                    _ => {
                        log.borrow_mut().push(format!("{tag}:end"));
                        frame::leave(rt, s, Value::Null)
                    }
                }
            })
        };

        let a = run_fiber_async(&rt, rt.mk_action(mk("a", log.clone()), vec![]), vec![]);
        let b = run_fiber_async(&rt, rt.mk_action(mk("b", log.clone()), vec![]), vec![]);
        a.await.unwrap();
        b.await.unwrap();

        let log = log.borrow();
        assert_eq!(log[0], "a:start");
        assert_eq!(log[1], "b:start");
        assert!(log.contains(&"a:end".to_string()));
        assert!(log.contains(&"b:end".to_string()));
    })
    .await;
}
