//! The resume / suspension protocol
//!
//! A native extension that needs to suspend follows a two-call dance: the
//! label function calls `setup_resume` at the call site, the extension claims
//! the one-shot continuation with `get_resume`, does its asynchronous work,
//! and eventually resolves it with a value. Resolution re-enters the
//! interpreter at the parked frame, or, when handed an `FnWrapper`, tail
//! calls the wrapped action on a fresh child frame.
//!
//! An extension that turns out not to need to suspend calls
//! `overwrite_resume` instead, which patches the current frame's pc and asks
//! the loop to re-dispatch it.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::errors::{oops, RuntimeError};
use crate::values::Value;

use super::exec_loop;
use super::frame::{self, FrameRef};
use super::Runtime;

/// One-shot continuation for a parked frame
#[derive(Clone)]
pub struct Resume {
    inner: Rc<ResumeInner>,
}

struct ResumeInner {
    rt: Weak<Runtime>,
    frame: FrameRef,
    ret_pc: i32,
    consumed: Cell<bool>,
}

impl Resume {
    fn new(rt: &Rc<Runtime>, frame: &FrameRef, ret_pc: i32) -> Self {
        Self {
            inner: Rc::new(ResumeInner {
                rt: Rc::downgrade(rt),
                frame: frame.clone(),
                ret_pc,
                consumed: Cell::new(false),
            }),
        }
    }

    /// Re-enter the interpreter with `v`. At most one invocation takes
    /// effect; later ones are silent no-ops, as is any invocation after the
    /// runtime dies. While a loop lock is held the resume is parked on the
    /// wait list and replayed at flush time.
    pub fn resolve(&self, v: Value) {
        let Some(rt) = self.inner.rt.upgrade() else {
            return;
        };
        if rt.is_dead() {
            return;
        }
        if rt.loop_lock_held() {
            let this = self.clone();
            rt.defer_while_locked(Box::new(move || this.resolve(v)));
            return;
        }
        if self.inner.consumed.replace(true) {
            tracing::trace!(target: "fibra", "resume fired more than once; ignored");
            return;
        }

        match v {
            Value::Fn(w) => self.tail_call(&rt, w),
            v => self.reenter(&rt, v),
        }
    }

    /// Plain resumption: deposit the value and continue the parked frame
    fn reenter(&self, rt: &Rc<Runtime>, v: Value) {
        {
            let mut f = self.inner.frame.borrow_mut();
            f.retval = v;
            if f.pc != self.inner.ret_pc {
                let fault = oops(format!(
                    "spurious re-entry (frame pc {} != resume pc {})",
                    f.pc, self.inner.ret_pc
                ));
                drop(f);
                exec_loop::handle_fault(rt, &self.inner.frame, fault);
                return;
            }
        }
        rt.bind_current();
        exec_loop::exec_loop(rt, Some(self.inner.frame.clone()));
    }

    /// Tail call the wrapped action on a fresh child of the parked frame.
    /// The lock across the tick bounce keeps a synchronously-completing
    /// callee from growing the native stack.
    fn tail_call(&self, rt: &Rc<Runtime>, w: crate::values::FnWrapper) {
        let label = match w.label() {
            Ok(label) => label,
            Err(err) => {
                exec_loop::handle_fault(rt, &self.inner.frame, err);
                return;
            }
        };
        let child = frame::child_frame(&self.inner.frame, label, w.args.clone(), w.caps());

        let token = rt.install_loop_lock();
        let rt = rt.clone();
        tokio::task::spawn_local(async move {
            rt.release_loop_lock(token);
            if rt.is_dead() {
                return;
            }
            rt.bind_current();
            match frame::action_call(&rt, &child, None) {
                Ok(f) => exec_loop::exec_loop(&rt, Some(f)),
                Err(err) => exec_loop::handle_fault(&rt, &child, err),
            }
            rt.flush_loop_lock();
        });
    }
}

/* ===================== Protocol entry points ===================== */

/// Install the one-shot resume for the frame parked at `ret_pc`. Fails if the
/// previous call site's resume was never claimed.
pub fn setup_resume(
    rt: &Rc<Runtime>,
    s: &FrameRef,
    ret_pc: i32,
) -> Result<(), RuntimeError> {
    check_resume_consumed(rt)?;
    s.borrow_mut().pc = ret_pc;
    rt.store_resume(Resume::new(rt, s, ret_pc));
    Ok(())
}

/// Claim the pending resume; each `setup_resume` produces exactly one
pub fn get_resume(rt: &Runtime) -> Result<Resume, RuntimeError> {
    rt.take_resume().ok_or_else(|| oops("noresume"))
}

/// Fails if a stored resume was never claimed by `get_resume`
pub fn check_resume_consumed(rt: &Runtime) -> Result<(), RuntimeError> {
    if rt.has_pending_resume() {
        Err(oops("getResume() not called"))
    } else {
        Ok(())
    }
}

/// Cancel the pending suspension: the extension completed synchronously.
/// Patches the current frame to `ret_pc` (when non-negative) and raises
/// `overwritten_pc` so the loop re-dispatches it.
pub fn overwrite_resume(rt: &Runtime, ret_pc: i32) -> Result<(), RuntimeError> {
    if rt.take_resume().is_none() {
        return Err(oops("overwrite_resume() without a pending resume"));
    }
    let frame = rt
        .curr_frame()
        .ok_or_else(|| oops("overwrite_resume() outside the loop"))?;
    let mut f = frame.borrow_mut();
    if ret_pc >= 0 {
        f.pc = ret_pc;
    }
    f.overwritten_pc = true;
    Ok(())
}
