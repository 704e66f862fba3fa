//! In-process debugger
//!
//! Breakpoints, step modes, trace mode and variable inspection. A label
//! function that crosses a mapped source location asks `should_break` and, if
//! so, parks the fiber through `breakpoint`; the host answers with a command
//! that picks the next step scope and re-enters the loop. While paused, the
//! heap snapshot taken at the stop answers `variables` requests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{json, Value as JsonValue};

use crate::bridge::{
    BreakpointEvent, DebuggerCommand, DebuggerEvent, OutboundMessage, StackFrameInfo, TraceEvent,
    VariablesEvent,
};
use crate::errors::{oops, RuntimeError};
use crate::runtime::frame::FrameRef;
use crate::runtime::scheduler::thread_pause;
use crate::runtime::Runtime;
use crate::values::{value_to_json, HeapData, Value};

/* ===================== State ===================== */

/// Debugger state machine
pub struct Debugger {
    breakpoints: RefCell<Vec<u8>>,
    break_always: Cell<bool>,
    break_frame: RefCell<Option<FrameRef>>,
    /// Fiber parked at a breakpoint, waiting for a command
    parked: RefCell<Option<FrameRef>>,
    /// Snapshot backing `variables` requests while paused
    heap: RefCell<HashMap<i32, Value>>,
    next_handle: Cell<i32>,
    trace_pause_ms: Cell<u64>,
}

impl Debugger {
    pub fn new(trace_pause_ms: u64) -> Self {
        Self {
            breakpoints: RefCell::new(Vec::new()),
            break_always: Cell::new(false),
            break_frame: RefCell::new(None),
            parked: RefCell::new(None),
            heap: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            trace_pause_ms: Cell::new(trace_pause_ms),
        }
    }

    /// Size the breakpoint bitmap for the loaded program
    pub fn setup(&self, num_breakpoints: usize) {
        *self.breakpoints.borrow_mut() = vec![0; num_breakpoints];
    }

    /// Reset the bitmap and arm the listed ids
    pub fn set_breakpoints(&self, ids: &[u32]) {
        let mut bitmap = self.breakpoints.borrow_mut();
        bitmap.fill(0);
        for &id in ids {
            if let Some(slot) = bitmap.get_mut(id as usize) {
                *slot = 1;
            }
        }
    }

    pub fn breakpoint_armed(&self, brk_id: u32) -> bool {
        self.breakpoints
            .borrow()
            .get(brk_id as usize)
            .map(|b| *b != 0)
            .unwrap_or(false)
    }

    pub fn break_always(&self) -> bool {
        self.break_always.get()
    }

    pub fn trace_pause_ms(&self) -> u64 {
        self.trace_pause_ms.get()
    }

    pub fn is_paused(&self) -> bool {
        self.parked.borrow().is_some()
    }

    /// Whether `break_always` should actually stop at `s`: true with no step
    /// scope, else true when `s` lies on the break frame's ancestor chain.
    pub fn is_break_frame(&self, s: &FrameRef) -> bool {
        let anchor = self.break_frame.borrow().clone();
        let Some(anchor) = anchor else {
            return true;
        };
        let mut cursor = Some(anchor);
        while let Some(f) = cursor {
            if Rc::ptr_eq(&f, s) {
                return true;
            }
            cursor = f.borrow().parent.clone();
        }
        false
    }

    fn snapshot_value(&self, heap: &mut HashMap<i32, Value>, v: &Value) -> JsonValue {
        match v {
            Value::Ref(_) | Value::Fn(_) => {
                let handle = self.next_handle.get();
                self.next_handle.set(handle + 1);
                heap.insert(handle, v.clone());
                json!({ "id": handle, "preview": format!("{v:?}") })
            }
            scalar => value_to_json(scalar),
        }
    }
}

/* ===================== Safepoint entry points ===================== */

/// Decide whether a mapped location should stop this fiber
pub fn should_break(rt: &Runtime, s: &FrameRef, brk_id: u32) -> bool {
    let dbg = rt.debugger();
    dbg.breakpoint_armed(brk_id) || (dbg.break_always() && dbg.is_break_frame(s))
}

/// Park the fiber at a breakpoint and report it to the host
pub fn breakpoint(
    rt: &Rc<Runtime>,
    s: &FrameRef,
    ret_pc: i32,
    brk_id: u32,
    r0: Value,
) -> Result<Option<FrameRef>, RuntimeError> {
    let dbg = rt.debugger();
    if dbg.is_paused() {
        return Err(oops("breakpoint() while already paused"));
    }
    {
        let mut f = s.borrow_mut();
        f.pc = ret_pc;
        f.r0 = r0;
        f.last_brk_id = brk_id as i32;
    }
    // The stop consumes the pending step request; the next command sets a
    // fresh scope.
    dbg.break_always.set(false);
    *dbg.break_frame.borrow_mut() = None;

    let (msg, heap) = get_breakpoint_msg(rt, s, brk_id);
    *dbg.heap.borrow_mut() = heap;
    rt.post_message(OutboundMessage::Debugger(DebuggerEvent::Breakpoint(msg)));
    *dbg.parked.borrow_mut() = Some(s.clone());
    Ok(None)
}

/// Build the breakpoint report plus the heap snapshot backing it
pub fn get_breakpoint_msg(
    rt: &Rc<Runtime>,
    s: &FrameRef,
    brk_id: u32,
) -> (BreakpointEvent, HashMap<i32, Value>) {
    let dbg = rt.debugger();
    dbg.next_handle.set(1);

    let mut heap = HashMap::new();
    let mut globals = serde_json::Map::new();
    for (name, value) in rt.globals_snapshot() {
        globals.insert(name, dbg.snapshot_value(&mut heap, &value));
    }

    let mut stackframes = Vec::new();
    let mut cursor = Some(s.clone());
    while let Some(f) = cursor {
        let f = f.borrow();
        stackframes.push(StackFrameInfo {
            depth: f.depth,
            breakpoint_id: f.last_brk_id,
        });
        cursor = f.parent.clone();
    }

    let msg = BreakpointEvent {
        breakpoint_id: brk_id,
        globals: JsonValue::Object(globals),
        stackframes,
        exception_message: None,
        exception_stack: None,
    };
    (msg, heap)
}

/// Cross a traced position: report it when it maps into the main source,
/// then pause the fiber for the configured interval (zero still yields).
pub fn trace(
    rt: &Rc<Runtime>,
    brk_id: u32,
    s: &FrameRef,
    ret_pc: i32,
    in_main: bool,
) -> Result<Option<FrameRef>, RuntimeError> {
    s.borrow_mut().last_brk_id = brk_id as i32;
    let pause_ms = if in_main {
        rt.post_message(OutboundMessage::Debugger(DebuggerEvent::Trace(TraceEvent {
            breakpoint_id: brk_id,
        })));
        rt.debugger().trace_pause_ms()
    } else {
        0
    };
    thread_pause(rt, s, ret_pc, pause_ms)
}

/* ===================== Host commands ===================== */

/// Interpret a debugger command from the host
pub fn handle_message(rt: &Rc<Runtime>, cmd: DebuggerCommand) {
    let dbg = rt.debugger();
    match cmd {
        DebuggerCommand::Config { set_breakpoints } => {
            dbg.set_breakpoints(&set_breakpoints);
        }
        DebuggerCommand::TraceConfig { interval } => {
            dbg.trace_pause_ms.set(interval);
        }
        DebuggerCommand::Pause => {
            dbg.break_always.set(true);
            *dbg.break_frame.borrow_mut() = None;
        }
        DebuggerCommand::Variables {
            variables_reference,
            seq,
        } => {
            let variables = resolve_variables(rt, variables_reference);
            rt.post_message(OutboundMessage::Debugger(DebuggerEvent::Variables(
                VariablesEvent {
                    req_seq: seq,
                    variables,
                },
            )));
        }
        DebuggerCommand::Resume => step_command(rt, StepMode::Resume),
        DebuggerCommand::StepOver => step_command(rt, StepMode::Over),
        DebuggerCommand::StepInto => step_command(rt, StepMode::Into),
        DebuggerCommand::StepOut => step_command(rt, StepMode::Out),
    }
}

enum StepMode {
    Resume,
    Over,
    Into,
    Out,
}

fn step_command(rt: &Rc<Runtime>, mode: StepMode) {
    let dbg = rt.debugger();
    let Some(s) = dbg.parked.borrow_mut().take() else {
        return;
    };
    if rt.is_dead() {
        return;
    }
    dbg.heap.borrow_mut().clear();

    match mode {
        StepMode::Resume => {
            dbg.break_always.set(false);
            *dbg.break_frame.borrow_mut() = None;
        }
        StepMode::Over => {
            dbg.break_always.set(true);
            *dbg.break_frame.borrow_mut() = Some(s.clone());
        }
        StepMode::Into => {
            dbg.break_always.set(true);
            *dbg.break_frame.borrow_mut() = None;
        }
        StepMode::Out => {
            let parent = s.borrow().parent.clone();
            dbg.break_always.set(true);
            *dbg.break_frame.borrow_mut() = Some(parent.unwrap_or_else(|| s.clone()));
        }
    }
    rt.enter_loop(s);
}

/// Resolve a variables-reference against the pause-time heap snapshot
fn resolve_variables(rt: &Rc<Runtime>, handle: i32) -> JsonValue {
    let dbg = rt.debugger();
    if !dbg.is_paused() {
        return JsonValue::Null;
    }
    let target = dbg.heap.borrow().get(&handle).cloned();
    let Some(target) = target else {
        return JsonValue::Null;
    };

    let mut heap = dbg.heap.borrow_mut();
    let mut fields = serde_json::Map::new();
    match &target {
        Value::Ref(obj) => match &*obj.data() {
            HeapData::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    fields.insert(i.to_string(), dbg.snapshot_value(&mut heap, item));
                }
            }
            HeapData::Obj(map) => {
                let mut names: Vec<&String> = map.keys().collect();
                names.sort();
                for name in names {
                    fields.insert(name.clone(), dbg.snapshot_value(&mut heap, &map[name]));
                }
            }
            HeapData::Action { caps, .. } => {
                for (i, cap) in caps.iter().enumerate() {
                    fields.insert(format!("cap{i}"), dbg.snapshot_value(&mut heap, cap));
                }
            }
        },
        other => {
            fields.insert("value".into(), value_to_json(other));
        }
    }
    JsonValue::Object(fields)
}
