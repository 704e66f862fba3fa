//! The interpreter loop
//!
//! Drives `frame = frame.label(frame)` until the chain terminates or the
//! current fiber parks. Only one activation of the loop may be on the call
//! stack at a time; scheduled re-entries hold the loop lock until just before
//! they call back in.
//!
//! The loop is also the catch boundary: a fault returned by a label function
//! never unwinds further. The faulting fiber is dead, but the runtime stays
//! alive for debugger traffic until the host kills it.

use std::rc::Rc;

use crate::bridge::{DebuggerEvent, OutboundMessage};
use crate::errors::RuntimeError;

use super::frame::FrameRef;
use super::Runtime;

/// Run until the frame chain is exhausted or the fiber parks
pub fn exec_loop(rt: &Rc<Runtime>, p: Option<FrameRef>) {
    if rt.loop_lock_held() {
        // A scheduled re-entry owns the loop right now; entering here would
        // put two activations on the stack.
        tracing::error!(target: "fibra", runtime = %rt.id(), "loop entered while locked");
        debug_assert!(false, "exec_loop entered while the loop lock is held");
        return;
    }

    let mut p = p;
    while let Some(frame) = p.take() {
        if rt.is_dead() {
            return;
        }
        rt.set_curr_frame(Some(frame.clone()));
        frame.borrow_mut().overwritten_pc = false;

        let label = frame.borrow().label.clone();
        let stepped = (*label)(rt, &frame);
        rt.flush_display_updates();

        match stepped {
            Ok(next) => {
                // A resume that never suspended asks for this frame again at
                // a patched pc instead of whatever the label returned.
                p = if frame.borrow().overwritten_pc {
                    Some(frame.clone())
                } else {
                    next
                };
            }
            Err(err) => {
                handle_fault(rt, &frame, err);
                return;
            }
        }
    }
}

/// Surface a fault that crossed the loop boundary
pub(crate) fn handle_fault(rt: &Rc<Runtime>, frame: &FrameRef, err: RuntimeError) {
    tracing::debug!(target: "fibra", runtime = %rt.id(), %err, "fiber fault");
    if rt.fire_error_handler(&err) {
        return;
    }

    let brk_id = frame.borrow().last_brk_id.max(0) as u32;
    let mut msg = crate::debugger::get_breakpoint_msg(rt, frame, brk_id).0;
    msg.exception_message = Some(err.to_string());
    msg.exception_stack = Some(render_fiber_stack(frame));
    rt.post_message(OutboundMessage::Debugger(DebuggerEvent::Breakpoint(msg)));
    rt.fire_post_error(&err);
}

/// Render the parked frame chain the way a stack trace reads
pub(crate) fn render_fiber_stack(frame: &FrameRef) -> String {
    let mut out = String::new();
    let mut cursor = Some(frame.clone());
    while let Some(f) = cursor {
        let f = f.borrow();
        out.push_str(&format!(
            "  at depth {} (pc {}, breakpoint {})\n",
            f.depth, f.pc, f.last_brk_id
        ));
        cursor = f.parent.clone();
    }
    out
}
