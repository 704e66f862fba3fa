//! Runtime fault types
//!
//! Every fault a label function or native extension can raise flows through
//! `RuntimeError`. The interpreter loop is the catch boundary: errors returned
//! from a label function never unwind past it (see `runtime::exec_loop`).

use thiserror::Error;

/// A fault raised while driving a fiber
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    /// Error raised by program code via `user_error` (or the depth cap)
    #[error("{0}")]
    User(String),

    /// Call depth exceeded the configured cap
    #[error("stack overflow (depth {depth} exceeds cap {max})")]
    StackOverflow { depth: u32, max: u32 },

    /// Protocol misuse by a native extension, e.g. `get_resume` called twice
    #[error("runtime oops: {0}")]
    Oops(String),

    /// Internal invariant violated
    #[error("assertion failed: {0}")]
    Assert(String),
}

impl RuntimeError {
    /// User-level faults surface through the breakpoint/exception path;
    /// the stack-overflow cap propagates the same way.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::User(_) | RuntimeError::StackOverflow { .. }
        )
    }
}

/// Build a user error (the fault a program raises on purpose)
pub fn user_error(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::User(msg.into())
}

/// Build a protocol-misuse fault
pub fn oops(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::Oops(msg.into())
}

/// Guard an internal invariant
pub fn runtime_assert(cond: bool, msg: &str) -> Result<(), RuntimeError> {
    if cond {
        Ok(())
    } else {
        tracing::error!(target: "fibra", "assertion failed: {msg}");
        Err(RuntimeError::Assert(msg.to_string()))
    }
}
