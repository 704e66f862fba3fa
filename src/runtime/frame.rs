//! Stack frames and the call/return primitives
//!
//! A frame is one activation on a fiber. Its label function runs one basic
//! block: it consumes the frame, advances `pc`, and returns the next frame to
//! dispatch, usually itself, a child, or (via `leave`) its parent. Chains are
//! acyclic and bottom out at a sentinel whose label delivers the final return
//! value to the host callback.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::{oops, RuntimeError};
use crate::values::Value;

use super::Runtime;

/// Shared handle to a frame
pub type FrameRef = Rc<RefCell<Frame>>;

/// One basic block of compiled code
pub type LabelFnRef =
    Rc<dyn Fn(&Rc<Runtime>, &FrameRef) -> Result<Option<FrameRef>, RuntimeError>>;

/// Callback fired when a frame leaves, with the value it returned
pub type FinalCallback = Box<dyn FnOnce(&Rc<Runtime>, Value)>;

/// Wrap a closure as a label function
pub fn label<F>(f: F) -> LabelFnRef
where
    F: Fn(&Rc<Runtime>, &FrameRef) -> Result<Option<FrameRef>, RuntimeError> + 'static,
{
    Rc::new(f)
}

/// One activation record
pub struct Frame {
    /// Label function driving this activation
    pub label: LabelFnRef,

    /// Program counter within the label
    pub pc: i32,

    /// Owning frame; None only for the sentinel bottom frame
    pub parent: Option<FrameRef>,

    /// Strictly one more than the parent's depth
    pub depth: u32,

    /// Scratch register preserved across yields
    pub r0: Value,

    /// Value deposited by a child upon leaving
    pub retval: Value,

    /// Raised by `overwrite_resume` to force a re-dispatch of this frame
    pub overwritten_pc: bool,

    /// Continuation invoked with the return value when this frame leaves
    pub final_callback: Option<FinalCallback>,

    /// Arguments for closure dispatch
    pub lambda_args: Vec<Value>,

    /// Captured variables for closure dispatch
    pub caps: Vec<Value>,

    /// Last breakpoint id crossed, kept for exception context
    pub last_brk_id: i32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("pc", &self.pc)
            .field("depth", &self.depth)
            .field("r0", &self.r0)
            .field("retval", &self.retval)
            .field("overwritten_pc", &self.overwritten_pc)
            .field("lambda_args", &self.lambda_args)
            .field("caps", &self.caps)
            .field("last_brk_id", &self.last_brk_id)
            .finish()
    }
}

impl Frame {
    fn new(label: LabelFnRef, parent: Option<FrameRef>, depth: u32) -> FrameRef {
        Rc::new(RefCell::new(Frame {
            label,
            pc: 0,
            parent,
            depth,
            r0: Value::Null,
            retval: Value::Null,
            overwritten_pc: false,
            final_callback: None,
            lambda_args: Vec::new(),
            caps: Vec::new(),
            last_brk_id: -1,
        }))
    }
}

/// Build a child frame under `parent` for the given label.
/// The frame is not yet dispatchable; run it through `action_call` first.
pub fn child_frame(
    parent: &FrameRef,
    label: LabelFnRef,
    lambda_args: Vec<Value>,
    caps: Vec<Value>,
) -> FrameRef {
    let frame = Frame::new(label, Some(parent.clone()), 0);
    {
        let mut f = frame.borrow_mut();
        f.lambda_args = lambda_args;
        f.caps = caps;
    }
    frame
}

/// Universal return primitive: deposit `v` in the parent's `retval`, fire the
/// final callback if one was installed, and hand control back to the parent.
pub fn leave(
    rt: &Rc<Runtime>,
    s: &FrameRef,
    v: Value,
) -> Result<Option<FrameRef>, RuntimeError> {
    let parent = s
        .borrow()
        .parent
        .clone()
        .ok_or_else(|| oops("leave() on the bottom frame"))?;
    parent.borrow_mut().retval = v.clone();
    let callback = s.borrow_mut().final_callback.take();
    if let Some(callback) = callback {
        callback(rt, v);
    }
    Ok(Some(parent))
}

/// Prepare a child frame for dispatch: fix up its depth, enforce the depth
/// cap, reset `pc`, and optionally bind a final callback.
pub fn action_call(
    rt: &Rc<Runtime>,
    frame: &FrameRef,
    callback: Option<FinalCallback>,
) -> Result<FrameRef, RuntimeError> {
    let max = rt.config().max_stack_depth;
    {
        let mut f = frame.borrow_mut();
        let parent_depth = match &f.parent {
            Some(p) => p.borrow().depth,
            None => return Err(oops("action_call() on a parentless frame")),
        };
        f.depth = parent_depth + 1;
        if f.depth > max {
            return Err(RuntimeError::StackOverflow { depth: f.depth, max });
        }
        f.pc = 0;
        if let Some(callback) = callback {
            f.final_callback = Some(callback);
        }
    }
    Ok(frame.clone())
}

/// Fabricate the sentinel bottom frame: its label reads its own `retval`,
/// hands it to `on_done`, and returns None, terminating the loop cleanly.
pub fn setup_top_core(on_done: FinalCallback) -> FrameRef {
    let done = Rc::new(RefCell::new(Some(on_done)));
    let sentinel = label(move |rt, s: &FrameRef| {
        let v = s.borrow().retval.clone();
        if let Some(callback) = done.borrow_mut().take() {
            callback(rt, v);
        }
        Ok(None)
    });
    Frame::new(sentinel, None, 0)
}
