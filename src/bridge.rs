//! Host-bridge message envelopes
//!
//! The runtime is embedded: everything it tells the outer tool rides a single
//! ordered sink, and everything the tool tells it arrives as an inbound
//! message. Only the shapes live here; the transport belongs to the host.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

/* ===================== Outbound ===================== */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Killed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMessage {
    pub runtimeid: String,
    pub state: RunState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialMessage {
    pub data: String,
    pub id: String,
    pub sim: bool,
}

/// One entry of the fiber stack reported at a breakpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackFrameInfo {
    pub depth: u32,
    #[serde(rename = "breakpointId")]
    pub breakpoint_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakpointEvent {
    #[serde(rename = "breakpointId")]
    pub breakpoint_id: u32,
    pub globals: JsonValue,
    pub stackframes: Vec<StackFrameInfo>,
    #[serde(rename = "exceptionMessage", skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    #[serde(rename = "exceptionStack", skip_serializing_if = "Option::is_none")]
    pub exception_stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    #[serde(rename = "breakpointId")]
    pub breakpoint_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariablesEvent {
    pub req_seq: u32,
    pub variables: JsonValue,
}

/// Debugger traffic from the runtime to the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "subtype", rename_all = "lowercase")]
pub enum DebuggerEvent {
    Breakpoint(BreakpointEvent),
    Trace(TraceEvent),
    Variables(VariablesEvent),
}

/// Everything the runtime posts to the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Status(StatusMessage),
    Serial(SerialMessage),
    Debugger(DebuggerEvent),
}

/* ===================== Inbound ===================== */

/// Debugger commands from the host, distinguished by `subtype`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "subtype", rename_all = "lowercase")]
pub enum DebuggerCommand {
    Config {
        #[serde(rename = "setBreakpoints", default)]
        set_breakpoints: Vec<u32>,
    },
    #[serde(rename = "traceConfig")]
    TraceConfig { interval: u64 },
    Pause,
    Resume,
    StepOver,
    StepInto,
    StepOut,
    Variables {
        #[serde(rename = "variablesReference")]
        variables_reference: i32,
        seq: u32,
    },
}

/// Everything the host sends to a running runtime
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Debugger(DebuggerCommand),
    Custom {
        #[serde(flatten)]
        body: JsonValue,
    },
}

/* ===================== Channel ===================== */

/// Sending half of the host bridge; delivery is FIFO
#[derive(Clone)]
pub struct MessageChannel {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl MessageChannel {
    /// Post a message to the host. A disconnected host is not an error;
    /// the runtime keeps running (and keeps being killable) without one.
    pub fn post(&self, msg: OutboundMessage) {
        let _ = self.tx.send(msg);
    }
}

/// Create the outbound side of the host bridge
pub fn channel() -> (MessageChannel, mpsc::UnboundedReceiver<OutboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MessageChannel { tx }, rx)
}

/* ===================== Serial buffer ===================== */

use std::cell::RefCell;

/// Accumulates serial output; flushes on newline or once the buffer grows
/// past the configured threshold.
pub struct SerialBuffer {
    buffer: RefCell<String>,
    flush_len: usize,
}

impl SerialBuffer {
    pub fn new(flush_len: usize) -> Self {
        Self {
            buffer: RefCell::new(String::new()),
            flush_len,
        }
    }

    /// Append data; returns the buffer contents when a flush is due
    pub fn write(&self, data: &str) -> Option<String> {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push_str(data);
        if buffer.contains('\n') || buffer.chars().count() > self.flush_len {
            Some(std::mem::take(&mut *buffer))
        } else {
            None
        }
    }

    /// Take whatever is buffered, flushed or not
    pub fn drain(&self) -> Option<String> {
        let mut buffer = self.buffer.borrow_mut();
        if buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_shape() {
        let msg = OutboundMessage::Status(StatusMessage {
            runtimeid: "rt-1".into(),
            state: RunState::Running,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "status", "runtimeid": "rt-1", "state": "running" })
        );
    }

    #[test]
    fn test_breakpoint_shape_skips_empty_exception() {
        let msg = OutboundMessage::Debugger(DebuggerEvent::Breakpoint(BreakpointEvent {
            breakpoint_id: 4,
            globals: json!({}),
            stackframes: vec![],
            exception_message: None,
            exception_stack: None,
        }));
        let j = serde_json::to_value(&msg).unwrap();
        assert_eq!(j["type"], "debugger");
        assert_eq!(j["subtype"], "breakpoint");
        assert_eq!(j["breakpointId"], 4);
        assert!(j.get("exceptionMessage").is_none());
    }

    #[test]
    fn test_debugger_command_parsing() {
        let cmd: DebuggerCommand =
            serde_json::from_value(json!({ "subtype": "config", "setBreakpoints": [1, 3] }))
                .unwrap();
        assert_eq!(
            cmd,
            DebuggerCommand::Config {
                set_breakpoints: vec![1, 3]
            }
        );

        let cmd: DebuggerCommand =
            serde_json::from_value(json!({ "subtype": "traceConfig", "interval": 10 })).unwrap();
        assert_eq!(cmd, DebuggerCommand::TraceConfig { interval: 10 });

        let cmd: DebuggerCommand =
            serde_json::from_value(json!({ "subtype": "stepover" })).unwrap();
        assert_eq!(cmd, DebuggerCommand::StepOver);

        let cmd: DebuggerCommand = serde_json::from_value(
            json!({ "subtype": "variables", "variablesReference": 7, "seq": 12 }),
        )
        .unwrap();
        assert_eq!(
            cmd,
            DebuggerCommand::Variables {
                variables_reference: 7,
                seq: 12
            }
        );
    }

    #[test]
    fn test_serial_buffer_flush_rules() {
        let serial = SerialBuffer::new(16);
        assert_eq!(serial.write("abc"), None);
        assert_eq!(serial.write("def\n"), Some("abcdef\n".to_string()));
        // 17 characters without a newline also flushes
        assert_eq!(serial.write(&"x".repeat(17)), Some("x".repeat(17)));
        assert_eq!(serial.drain(), None);
        serial.write("tail");
        assert_eq!(serial.drain(), Some("tail".to_string()));
    }
}
