//! Test helpers for runtime tests
//!
//! Builders for throwaway runtimes, programs made of hand-written label
//! functions, and outbound-message capture.

use std::future::Future;
use std::rc::Rc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::bridge::{self, OutboundMessage};
use crate::config::Config;
use crate::loader::{CompiledProgram, RunRequest};
use crate::runtime::frame::LabelFnRef;
use crate::runtime::Runtime;

/// Run a future inside a LocalSet, the stand-in for the host event loop
pub async fn run_local<F: Future>(f: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(f).await
}

/// Runtime wired to a capture channel, with default config
pub fn test_runtime(
    program: CompiledProgram,
) -> (Rc<Runtime>, UnboundedReceiver<OutboundMessage>) {
    test_runtime_with(program, Config::default(), false)
}

pub fn test_runtime_with(
    program: CompiledProgram,
    config: Config,
    ref_counting_debug: bool,
) -> (Rc<Runtime>, UnboundedReceiver<OutboundMessage>) {
    let (channel, rx) = bridge::channel();
    let req = RunRequest::new(program)
        .with_id("rt-test")
        .with_ref_counting_debug(ref_counting_debug);
    let rt = Runtime::new(req, channel, config).expect("runtime construction failed");
    (rt, rx)
}

/// Wrap a single entry label as a minimal program
pub fn program(entry: LabelFnRef) -> CompiledProgram {
    CompiledProgram::builder(entry).build()
}

/// Drain every message posted so far
pub fn drain(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Opt-in log output while debugging a failing test
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
