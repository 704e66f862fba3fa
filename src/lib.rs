pub mod bridge;
pub mod config;
pub mod debugger;
pub mod errors;
pub mod events;
pub mod loader;
pub mod refcount;
pub mod runtime;
pub mod values;

// Re-export main types
pub use bridge::{DebuggerCommand, InboundMessage, MessageChannel, OutboundMessage, RunState};
pub use config::Config;
pub use errors::{oops, user_error, RuntimeError};
pub use loader::{CompiledProgram, RunRequest};
pub use runtime::{current, Runtime};
pub use values::{FnWrapper, RefObject, Value};

// Re-export the label-function ABI for convenience
pub use runtime::fiber::run_fiber_async;
pub use runtime::frame::{action_call, label, leave, FrameRef, LabelFnRef};
pub use runtime::resume::{
    check_resume_consumed, get_resume, overwrite_resume, setup_resume, Resume,
};
pub use runtime::scheduler::{maybe_yield, thread_pause};
