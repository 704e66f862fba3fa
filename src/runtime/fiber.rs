//! Fiber spawning
//!
//! A fiber is an independent frame chain sharing the single interpreter
//! loop. `run_fiber_async` starts one from outside the loop (event handlers
//! and host-initiated calls arrive this way) and resolves when the fiber's
//! sentinel fires.

use std::rc::Rc;

use tokio::sync::oneshot;

use crate::errors::{oops, RuntimeError};
use crate::values::{self, Value};

use super::exec_loop::handle_fault;
use super::frame::{self, FrameRef};
use super::Runtime;

/// Start `action` as a fresh fiber with up to three arguments. The returned
/// receiver resolves with the fiber's return value; it errors out instead if
/// the runtime dies before the fiber completes.
pub fn run_fiber_async(
    rt: &Rc<Runtime>,
    action: Value,
    args: Vec<Value>,
) -> oneshot::Receiver<Value> {
    values::incr(&action);
    let (tx, rx) = oneshot::channel();
    let rt = rt.clone();
    tokio::task::spawn_local(async move {
        if rt.is_dead() {
            rt.release_value(&action);
            return;
        }
        rt.bind_current();
        let top = rt.setup_top(Box::new(move |_rt, v| {
            let _ = tx.send(v);
        }));
        if let Err(err) = dispatch_action(&rt, &top, &action, args) {
            handle_fault(&rt, &top, err);
        }
        // Balanced against the increment taken at spawn: the action frame
        // now holds the live reference.
        rt.release_value(&action);
    });
    rx
}

fn dispatch_action(
    rt: &Rc<Runtime>,
    top: &FrameRef,
    action: &Value,
    mut args: Vec<Value>,
) -> Result<(), RuntimeError> {
    let w = match action {
        Value::Fn(w) => w.clone(),
        other => {
            return Err(oops(format!(
                "run_fiber_async() needs an action, got {other:?}"
            )))
        }
    };
    args.truncate(3);
    let mut lambda_args = w.args.clone();
    lambda_args.extend(args);

    let child = frame::child_frame(top, w.label()?, lambda_args, w.caps());
    let child = frame::action_call(rt, &child, None)?;
    rt.enter_loop(child);
    Ok(())
}
