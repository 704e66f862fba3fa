//! Tests for the event queue: capacity, fan-out, awaiters and the handler
//! registry's refcount discipline

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::helpers::{program, run_local, test_runtime};
use crate::events::{wait_for_event, EventQueue};
use crate::runtime::frame::{self, label, LabelFnRef};
use crate::runtime::scheduler::thread_pause;
use crate::runtime::Runtime;
use crate::values::Value;

fn idle_runtime() -> Rc<Runtime> {
    let entry = label(|rt, s| frame::leave(rt, s, Value::Null));
    // Dropping the receiver is fine: posts to a disconnected host are no-ops
    let (rt, _rx) = test_runtime(program(entry));
    rt
}

/// Handler that records `(handler, value)` then stalls for `pause_ms`
fn slow_handler(
    idx: usize,
    log: Rc<RefCell<Vec<(usize, f64)>>>,
    pause_ms: u64,
) -> LabelFnRef {
    label(move |rt, s| {
        let pc = s.borrow().pc;
        match pc {
            0 => {
                let v = s.borrow().lambda_args[0].as_num().unwrap();
                log.borrow_mut().push((idx, v));
                thread_pause(rt, s, 1, pause_ms)
            }
            _ => frame::leave(rt, s, Value::Null),
        }
    })
}

async fn drained(q: &Rc<EventQueue>) {
    while q.is_draining() || q.pending_events() > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_capacity_bound_with_fifo_fanout() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());
        let log = Rc::new(RefCell::new(Vec::new()));

        for idx in 0..3 {
            q.add_handler(rt.mk_action(slow_handler(idx, log.clone(), 5), vec![]));
        }

        // Six rapid pushes against capacity five: the drain has not started
        // yet, so exactly one is dropped.
        for v in 1..=6 {
            q.push(Value::Num(v as f64), false);
        }
        assert_eq!(q.pending_events(), 5);

        drained(&q).await;

        let log = log.borrow();
        for idx in 0..3usize {
            let seen: Vec<f64> = log
                .iter()
                .filter(|(i, _)| *i == idx)
                .map(|(_, v)| *v)
                .collect();
            assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0, 5.0], "handler {idx}");
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_one_event_at_a_time() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());
        let log = Rc::new(RefCell::new(Vec::new()));

        // One quick and one slow handler: the second event must wait for the
        // slow fiber of the first.
        q.add_handler(rt.mk_action(slow_handler(0, log.clone(), 5), vec![]));
        q.add_handler(rt.mk_action(slow_handler(1, log.clone(), 20), vec![]));

        q.push(Value::Num(1.0), false);
        q.push(Value::Num(2.0), false);
        drained(&q).await;

        let log = log.borrow();
        let last_first = log.iter().rposition(|(_, v)| *v == 1.0).unwrap();
        let first_second = log.iter().position(|(_, v)| *v == 2.0).unwrap();
        assert!(last_first < first_second, "second event started early: {log:?}");
    })
    .await;
}

#[tokio::test]
async fn test_awaiter_batch_snapshot() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());

        let woken = Rc::new(Cell::new(0u32));
        // First awaiter re-registers itself on wake; the fresh registration
        // must land in the next batch, not this one.
        {
            let woken = woken.clone();
            let q2 = q.clone();
            q.add_awaiter(Box::new(move || {
                woken.set(woken.get() + 1);
                let woken = woken.clone();
                q2.add_awaiter(Box::new(move || woken.set(woken.get() + 10)));
            }));
        }
        {
            let woken = woken.clone();
            q.add_awaiter(Box::new(move || woken.set(woken.get() + 1)));
        }

        q.push(Value::Num(1.0), false);
        assert_eq!(woken.get(), 2);
        assert_eq!(q.awaiter_count(), 1);

        q.push(Value::Num(2.0), false);
        assert_eq!(woken.get(), 12);
    })
    .await;
}

#[tokio::test]
async fn test_notify_one_wakes_head_only() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());

        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            q.add_awaiter(Box::new(move || order.borrow_mut().push(tag)));
        }

        q.push(Value::Num(1.0), true);
        assert_eq!(*order.borrow(), vec!["first"]);
        assert_eq!(q.awaiter_count(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_awaiters_wake_even_when_event_dropped() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());

        // Fill to capacity without letting the drain start
        for v in 1..=5 {
            q.push(Value::Num(v as f64), false);
        }
        assert_eq!(q.pending_events(), 5);

        let woken = Rc::new(Cell::new(false));
        {
            let woken = woken.clone();
            q.add_awaiter(Box::new(move || woken.set(true)));
        }

        // Sixth push is dropped, but the awaiter still wakes
        q.push(Value::Num(6.0), false);
        assert_eq!(q.pending_events(), 5);
        assert!(woken.get());
    })
    .await;
}

#[tokio::test]
async fn test_handler_refcount_balance() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());

        let a = rt.mk_action(label(|rt, s| frame::leave(rt, s, Value::Null)), vec![]);
        let b = rt.mk_action(label(|rt, s| frame::leave(rt, s, Value::Null)), vec![]);
        let obj_a = a.ref_object().unwrap().clone();
        let obj_b = b.ref_object().unwrap().clone();

        // Each registered occurrence holds one reference
        q.add_handler(a.clone());
        q.add_handler(a.clone());
        assert_eq!(obj_a.refs(), 3);

        q.remove_handler(&a);
        assert_eq!(q.handler_count(), 0);
        assert_eq!(obj_a.refs(), 1);

        q.add_handler(a.clone());
        q.set_handler(b.clone());
        assert_eq!(q.handler_count(), 1);
        assert_eq!(obj_a.refs(), 1);
        assert_eq!(obj_b.refs(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_late_handler_misses_earlier_events() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());
        let log = Rc::new(RefCell::new(Vec::new()));

        // No handlers yet: the event is enqueued and consumed by an empty
        // drain pass.
        q.push(Value::Num(1.0), false);
        drained(&q).await;

        q.add_handler(rt.mk_action(slow_handler(0, log.clone(), 0), vec![]));
        q.push(Value::Num(2.0), false);
        drained(&q).await;

        assert_eq!(*log.borrow(), vec![(0, 2.0)]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_event_parks_fiber() {
    run_local(async {
        let rt = idle_runtime();
        let q = EventQueue::new(rt.clone());

        let q2 = q.clone();
        let waiter = rt.mk_action(
            label(move |rt, s| {
                let pc = s.borrow().pc;
                match pc {
                    0 => wait_for_event(rt, &q2, s, 1),
                    _ => frame::leave(rt, s, Value::Bool(true)),
                }
            }),
            vec![],
        );

        let mut rx = crate::runtime::fiber::run_fiber_async(&rt, waiter, vec![]);
        tokio::task::yield_now().await;
        assert_eq!(q.awaiter_count(), 1);
        assert!(rx.try_recv().is_err());

        q.push(Value::Num(1.0), false);
        assert_eq!(rx.await.unwrap(), Value::Bool(true));
    })
    .await;
}
