//! Per-source event queues
//!
//! Each asynchronous source owns one bounded queue. Pushing wakes any parked
//! awaiters, then enqueues while under capacity; the drain delivers events
//! one at a time, fanning each out to every registered handler as a fresh
//! fiber and starting the next event only after the last handler fiber of the
//! current one completed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::errors::RuntimeError;
use crate::runtime::fiber::run_fiber_async;
use crate::runtime::frame::FrameRef;
use crate::runtime::resume::{get_resume, setup_resume};
use crate::runtime::Runtime;
use crate::values::{self, Value};

/// Adapter turning an event value into handler arguments
pub type EventArgs = Box<dyn Fn(&Value) -> Vec<Value>>;

struct QueueState {
    events: VecDeque<Value>,
    handlers: Vec<Value>,
    awaiters: Vec<Box<dyn FnOnce()>>,
    lock: bool,
}

/// Bounded FIFO of pending events with a handler registry
pub struct EventQueue {
    weak_self: Weak<EventQueue>,
    rt: Rc<Runtime>,
    max: usize,
    args_of: Option<EventArgs>,
    state: RefCell<QueueState>,
}

impl EventQueue {
    pub fn new(rt: Rc<Runtime>) -> Rc<Self> {
        let max = rt.config().event_queue_capacity;
        Self::with_capacity(rt, max)
    }

    pub fn with_capacity(rt: Rc<Runtime>, max: usize) -> Rc<Self> {
        Self::build(rt, max, None)
    }

    /// Queue whose handlers receive adapted arguments instead of the raw value
    pub fn with_adapter(rt: Rc<Runtime>, args_of: EventArgs) -> Rc<Self> {
        let max = rt.config().event_queue_capacity;
        Self::build(rt, max, Some(args_of))
    }

    fn build(rt: Rc<Runtime>, max: usize, args_of: Option<EventArgs>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            rt,
            max,
            args_of,
            state: RefCell::new(QueueState {
                events: VecDeque::new(),
                handlers: Vec::new(),
                awaiters: Vec::new(),
                lock: false,
            }),
        })
    }

    /* ===================== Push / drain ===================== */

    /// Deliver an event. Awaiters wake first: one of them with `notify_one`,
    /// otherwise the whole batch registered at this moment. The event itself
    /// is enqueued while under capacity and dropped otherwise.
    pub fn push(&self, value: Value, notify_one: bool) {
        let to_wake = {
            let mut st = self.state.borrow_mut();
            if st.awaiters.is_empty() {
                Vec::new()
            } else if notify_one {
                vec![st.awaiters.remove(0)]
            } else {
                // Snapshot-and-clear: awaiters added by woken code land in
                // the next batch.
                std::mem::take(&mut st.awaiters)
            }
        };
        for awaiter in to_wake {
            awaiter();
        }

        let start_drain = {
            let mut st = self.state.borrow_mut();
            if st.events.len() >= self.max {
                tracing::debug!(target: "fibra::events", "queue at capacity, event dropped");
                return;
            }
            st.events.push_back(value);
            st.events.len() == 1 && !st.lock
        };
        if start_drain {
            let q = self
                .weak_self
                .upgrade()
                .expect("queue invariant: weak_self always upgrades while alive");
            tokio::task::spawn_local(async move {
                q.poke().await;
            });
        }
    }

    /// Drain events one at a time until the queue is empty
    async fn poke(self: Rc<Self>) {
        self.state.borrow_mut().lock = true;
        loop {
            let (event, handlers) = {
                let mut st = self.state.borrow_mut();
                match st.events.pop_front() {
                    Some(event) => (event, st.handlers.clone()),
                    None => {
                        st.lock = false;
                        return;
                    }
                }
            };
            let args = match &self.args_of {
                Some(adapt) => adapt(&event),
                None => vec![event.clone()],
            };
            let fibers: Vec<_> = handlers
                .into_iter()
                .map(|handler| run_fiber_async(&self.rt, handler, args.clone()))
                .collect();
            for fiber in fibers {
                let _ = fiber.await;
            }
        }
    }

    /* ===================== Handler registry ===================== */

    pub fn add_handler(&self, action: Value) {
        values::incr(&action);
        self.state.borrow_mut().handlers.push(action);
    }

    /// Replace the whole handler list with a single action
    pub fn set_handler(&self, action: Value) {
        values::incr(&action);
        let old = std::mem::replace(&mut self.state.borrow_mut().handlers, vec![action]);
        for handler in &old {
            self.rt.release_value(handler);
        }
    }

    /// Remove every occurrence of `action`, releasing once per removal
    pub fn remove_handler(&self, action: &Value) {
        let removed = {
            let mut st = self.state.borrow_mut();
            let before = st.handlers.len();
            st.handlers.retain(|h| h != action);
            before - st.handlers.len()
        };
        for _ in 0..removed {
            self.rt.release_value(action);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.state.borrow().handlers.len()
    }

    pub fn pending_events(&self) -> usize {
        self.state.borrow().events.len()
    }

    /// True while a drain holds the queue lock
    pub fn is_draining(&self) -> bool {
        self.state.borrow().lock
    }

    /* ===================== Awaiters ===================== */

    /// Park a one-shot callback until the next push
    pub fn add_awaiter(&self, awaiter: Box<dyn FnOnce()>) {
        self.state.borrow_mut().awaiters.push(awaiter);
    }

    pub fn awaiter_count(&self) -> usize {
        self.state.borrow().awaiters.len()
    }
}

/// Park the current fiber until the queue sees any event
pub fn wait_for_event(
    rt: &Rc<Runtime>,
    queue: &EventQueue,
    s: &FrameRef,
    ret_pc: i32,
) -> Result<Option<FrameRef>, RuntimeError> {
    setup_resume(rt, s, ret_pc)?;
    let resume = get_resume(rt)?;
    queue.add_awaiter(Box::new(move || resume.resolve(Value::Null)));
    Ok(None)
}
