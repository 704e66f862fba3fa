//! The fiber runtime
//!
//! One `Runtime` drives one loaded program. All state is owned by the
//! single-threaded interpreter loop; native extensions re-enter it only
//! through the resume protocol, and the host reaches it only through the
//! message bridge. The module split mirrors the moving parts:
//!
//! - `frame`: activation records and the call/return primitives
//! - `exec_loop`: the interpreter loop and its error boundary
//! - `resume`: the suspension protocol for native extensions
//! - `scheduler`: cooperative yielding and the loop lock
//! - `fiber`: spawning concurrent fibers from outside the loop

pub mod exec_loop;
pub mod fiber;
pub mod frame;
pub mod resume;
pub mod scheduler;

#[cfg(test)]
mod tests;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::bridge::{
    InboundMessage, MessageChannel, OutboundMessage, RunState, SerialBuffer, SerialMessage,
    StatusMessage,
};
use crate::config::Config;
use crate::debugger::Debugger;
use crate::errors::{oops, RuntimeError};
use crate::loader::RunRequest;
use crate::refcount::LiveObjects;
use crate::values::{self, FnWrapper, RefObject, Value};

use frame::{FinalCallback, FrameRef, LabelFnRef};
use resume::Resume;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Runtime>>> = RefCell::new(None);
}

/// The runtime currently bound on this thread. Re-bound at every loop
/// re-entry so ambient callers (native extensions grabbing a resume)
/// always target the runtime that invoked them.
pub fn current() -> Option<Rc<Runtime>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Runtime state for one loaded program
pub struct Runtime {
    weak_self: Weak<Runtime>,
    id: String,
    config: Config,
    channel: MessageChannel,

    entry_point: LabelFnRef,
    ref_counting: bool,

    dead: Cell<bool>,
    running: Cell<bool>,
    start_time: Cell<Instant>,
    last_yield: Cell<Instant>,

    curr_frame: RefCell<Option<FrameRef>>,
    curr_resume: RefCell<Option<Resume>>,

    loop_lock: Cell<Option<u64>>,
    lock_seq: Cell<u64>,
    lock_wait_list: RefCell<VecDeque<Box<dyn FnOnce()>>>,

    globals: RefCell<HashMap<String, Value>>,
    live_objects: LiveObjects,
    debugger: Debugger,
    serial: SerialBuffer,

    update_pending: Cell<u32>,
    on_update: RefCell<Option<Rc<dyn Fn()>>>,
    error_handler: RefCell<Option<Rc<dyn Fn(&RuntimeError)>>>,
    post_error: RefCell<Option<Rc<dyn Fn(&RuntimeError)>>>,
    custom_message_handler: RefCell<Option<Rc<dyn Fn(JsonValue)>>>,
}

impl Runtime {
    /// Bind a run request to a fresh runtime. The program's globals are
    /// installed and the debugger is sized to its breakpoint map.
    pub fn new(req: RunRequest, channel: MessageChannel, config: Config) -> Result<Rc<Self>> {
        req.validate().context("invalid run request")?;

        let id = req
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let program = req.program;

        let live_objects = LiveObjects::new();
        live_objects.set_enabled(program.ref_counting && req.ref_counting_debug);

        let debugger = Debugger::new(config.trace_pause_ms);
        debugger.setup(program.num_breakpoints);

        let now = Instant::now();
        let serial_flush_len = config.serial_flush_len;
        let rt = Rc::new_cyclic(|weak_self| Runtime {
            weak_self: weak_self.clone(),
            id,
            config,
            channel,
            entry_point: program.entry_point,
            ref_counting: program.ref_counting,
            dead: Cell::new(false),
            running: Cell::new(false),
            start_time: Cell::new(now),
            last_yield: Cell::new(now),
            curr_frame: RefCell::new(None),
            curr_resume: RefCell::new(None),
            loop_lock: Cell::new(None),
            lock_seq: Cell::new(0),
            lock_wait_list: RefCell::new(VecDeque::new()),
            globals: RefCell::new(program.globals),
            live_objects,
            debugger,
            serial: SerialBuffer::new(serial_flush_len),
            update_pending: Cell::new(0),
            on_update: RefCell::new(None),
            error_handler: RefCell::new(None),
            post_error: RefCell::new(None),
            custom_message_handler: RefCell::new(None),
        });
        rt.bind_current();
        Ok(rt)
    }

    /// Owning handle back to this runtime; valid for as long as `&self` is
    pub(crate) fn rc(&self) -> Rc<Runtime> {
        self.weak_self
            .upgrade()
            .expect("runtime invariant: weak_self always upgrades while alive")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ref_counting(&self) -> bool {
        self.ref_counting
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    pub fn entry_point(&self) -> LabelFnRef {
        self.entry_point.clone()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Make this the ambient runtime for the thread
    pub fn bind_current(&self) {
        let rt = self.rc();
        CURRENT.with(|c| *c.borrow_mut() = Some(rt));
    }

    /* ===================== Lifecycle ===================== */

    /// Install the sentinel/entry frames and enter the loop. `on_done`
    /// receives the program's final return value; the runtime stays running
    /// (and the host keeps its debugger connection) until `kill`.
    pub fn top_call(
        &self,
        entry: LabelFnRef,
        on_done: FinalCallback,
    ) -> Result<(), RuntimeError> {
        if self.is_dead() {
            return Err(oops("top_call() on a dead runtime"));
        }
        if self.is_running() {
            return Err(oops("top_call() while already running"));
        }
        self.set_running(true);
        self.start_time.set(Instant::now());

        let rt = self.rc();
        let top = frame::setup_top_core(on_done);
        let entry_frame = frame::child_frame(&top, entry, Vec::new(), Vec::new());
        let entry_frame = frame::action_call(&rt, &entry_frame, None)?;
        self.bind_current();
        exec_loop::exec_loop(&rt, Some(entry_frame));
        Ok(())
    }

    /// Run the program's entry point; resolves with its return value
    pub fn run(&self) -> Result<oneshot::Receiver<Value>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        let entry = self.entry_point();
        self.top_call(
            entry,
            Box::new(move |_rt, v| {
                let _ = tx.send(v);
            }),
        )?;
        Ok(rx)
    }

    /// Produce a fresh sentinel for a new fiber, binding this runtime
    pub fn setup_top(&self, on_done: FinalCallback) -> FrameRef {
        self.bind_current();
        frame::setup_top_core(on_done)
    }

    /// Mark the runtime dead. Pending resumes, yielded continuations and
    /// debugger commands become silent no-ops.
    pub fn kill(&self) {
        if self.dead.replace(true) {
            return;
        }
        tracing::debug!(target: "fibra", runtime = %self.id, "killed");
        self.flush_serial();
        if self.live_objects.is_enabled() {
            self.live_objects.dump_live_pointers();
        }
        self.set_running(false);
    }

    fn set_running(&self, running: bool) {
        if self.running.get() == running {
            return;
        }
        self.running.set(running);
        let state = if running {
            RunState::Running
        } else {
            RunState::Killed
        };
        self.post_message(OutboundMessage::Status(StatusMessage {
            runtimeid: self.id.clone(),
            state,
        }));
    }

    /* ===================== Timing ===================== */

    /// Milliseconds since the run began
    pub fn running_time(&self) -> u64 {
        self.start_time.get().elapsed().as_millis() as u64
    }

    /// Microseconds since the run began, truncated to 32 bits
    pub fn running_time_us(&self) -> u32 {
        (self.start_time.get().elapsed().as_micros() & 0xffff_ffff) as u32
    }

    pub(crate) fn last_yield(&self) -> Instant {
        self.last_yield.get()
    }

    pub(crate) fn set_last_yield(&self, t: Instant) {
        self.last_yield.set(t);
    }

    /* ===================== Loop lock ===================== */

    pub(crate) fn loop_lock_held(&self) -> bool {
        self.loop_lock.get().is_some()
    }

    /// Install a fresh lock; the loop is quiescent but about to re-enter
    pub(crate) fn install_loop_lock(&self) -> u64 {
        let token = self.lock_seq.get() + 1;
        self.lock_seq.set(token);
        self.loop_lock.set(Some(token));
        token
    }

    pub(crate) fn release_loop_lock(&self, token: u64) {
        if self.loop_lock.get() == Some(token) {
            self.loop_lock.set(None);
        }
    }

    /// Park a thunk until the current lock holder flushes
    pub(crate) fn defer_while_locked(&self, thunk: Box<dyn FnOnce()>) {
        tracing::trace!(target: "fibra", runtime = %self.id, "resume deferred behind loop lock");
        self.lock_wait_list.borrow_mut().push_back(thunk);
    }

    /// Replay deferred resumes, stopping if one of them re-installs a lock
    pub(crate) fn flush_loop_lock(&self) {
        loop {
            if self.loop_lock_held() {
                break;
            }
            let thunk = self.lock_wait_list.borrow_mut().pop_front();
            match thunk {
                Some(thunk) => thunk(),
                None => break,
            }
        }
    }

    /// Re-enter the loop at `frame`, or defer the whole entry if a lock is
    /// currently held (used by entries racing a scheduled re-entry).
    pub(crate) fn enter_loop(&self, frame: FrameRef) {
        if self.loop_lock_held() {
            let rt = self.rc();
            self.defer_while_locked(Box::new(move || rt.enter_loop(frame)));
            return;
        }
        self.bind_current();
        exec_loop::exec_loop(&self.rc(), Some(frame));
    }

    /* ===================== Current frame / resume ===================== */

    pub(crate) fn set_curr_frame(&self, frame: Option<FrameRef>) {
        *self.curr_frame.borrow_mut() = frame;
    }

    pub fn curr_frame(&self) -> Option<FrameRef> {
        self.curr_frame.borrow().clone()
    }

    pub(crate) fn store_resume(&self, r: Resume) {
        *self.curr_resume.borrow_mut() = Some(r);
    }

    pub(crate) fn take_resume(&self) -> Option<Resume> {
        self.curr_resume.borrow_mut().take()
    }

    pub(crate) fn has_pending_resume(&self) -> bool {
        self.curr_resume.borrow().is_some()
    }

    /* ===================== Globals ===================== */

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn set_global(&self, name: impl Into<String>, v: Value) {
        self.globals.borrow_mut().insert(name.into(), v);
    }

    /// Stable-ordered snapshot for the debugger
    pub(crate) fn globals_snapshot(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = self
            .globals
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /* ===================== Heap ===================== */

    pub fn mk_list(&self, items: Vec<Value>) -> Value {
        let obj = RefObject::list(items);
        self.live_objects.register(&obj);
        Value::Ref(obj)
    }

    pub fn mk_obj(&self, fields: HashMap<String, Value>) -> Value {
        let obj = RefObject::obj(fields);
        self.live_objects.register(&obj);
        Value::Ref(obj)
    }

    /// Allocate an action value (a callable with captured variables)
    pub fn mk_action(&self, label: LabelFnRef, caps: Vec<Value>) -> Value {
        let obj = RefObject::action(label, caps);
        self.live_objects.register(&obj);
        Value::Fn(FnWrapper::new(obj, Vec::new()))
    }

    /// Release one reference; unregisters the object once its ledger is
    /// balanced to zero.
    pub fn release_value(&self, v: &Value) {
        if let Some(remaining) = values::decr(v) {
            if remaining == 0 {
                if let Some(obj) = v.ref_object() {
                    if let Err(err) = self.live_objects.unregister(obj, false) {
                        tracing::error!(target: "fibra", %err, "unbalanced release");
                    }
                }
            }
        }
    }

    pub fn unregister_live_object(
        &self,
        obj: &RefObject,
        keep_alive: bool,
    ) -> Result<(), RuntimeError> {
        self.live_objects.unregister(obj, keep_alive)
    }

    pub fn live_objects(&self) -> &LiveObjects {
        &self.live_objects
    }

    pub fn dump_live_pointers(&self) {
        self.live_objects.dump_live_pointers();
    }

    /* ===================== Host I/O ===================== */

    pub fn post_message(&self, msg: OutboundMessage) {
        self.channel.post(msg);
    }

    /// Buffer serial output, flushing on newline or overflow
    pub fn write_serial(&self, data: &str) {
        if let Some(chunk) = self.serial.write(data) {
            self.post_serial(chunk);
        }
    }

    pub fn flush_serial(&self) {
        if let Some(chunk) = self.serial.drain() {
            self.post_serial(chunk);
        }
    }

    fn post_serial(&self, data: String) {
        self.post_message(OutboundMessage::Serial(SerialMessage {
            data,
            id: self.id.clone(),
            sim: true,
        }));
    }

    /* ===================== Display updates ===================== */

    /// Request a coalesced host view refresh
    pub fn queue_display_update(&self) {
        self.update_pending.set(self.update_pending.get() + 1);
    }

    pub fn set_on_update(&self, hook: impl Fn() + 'static) {
        *self.on_update.borrow_mut() = Some(Rc::new(hook));
    }

    pub(crate) fn flush_display_updates(&self) {
        if self.update_pending.get() == 0 {
            return;
        }
        self.update_pending.set(0);
        let hook = self.on_update.borrow().clone();
        if let Some(hook) = hook {
            (*hook)();
        }
    }

    /* ===================== Host hooks ===================== */

    pub fn set_error_handler(&self, handler: impl Fn(&RuntimeError) + 'static) {
        *self.error_handler.borrow_mut() = Some(Rc::new(handler));
    }

    pub fn set_post_error(&self, hook: impl Fn(&RuntimeError) + 'static) {
        *self.post_error.borrow_mut() = Some(Rc::new(hook));
    }

    pub fn set_custom_message_handler(&self, hook: impl Fn(JsonValue) + 'static) {
        *self.custom_message_handler.borrow_mut() = Some(Rc::new(hook));
    }

    /// Hand the fault to the host's error handler, if one is installed
    pub(crate) fn fire_error_handler(&self, err: &RuntimeError) -> bool {
        let handler = self.error_handler.borrow().clone();
        match handler {
            Some(handler) => {
                (*handler)(err);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fire_post_error(&self, err: &RuntimeError) {
        let hook = self.post_error.borrow().clone();
        if let Some(hook) = hook {
            (*hook)(err);
        }
    }
}

/// Dispatch inbound host messages until the channel closes
pub async fn serve(rt: Rc<Runtime>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
    while let Some(msg) = inbound.recv().await {
        match msg {
            InboundMessage::Debugger(cmd) => crate::debugger::handle_message(&rt, cmd),
            InboundMessage::Custom { body } => {
                let hook = rt.custom_message_handler.borrow().clone();
                if let Some(hook) = hook {
                    (*hook)(body);
                }
            }
        }
    }
}
