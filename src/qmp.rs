//! QMP (QEMU Machine Protocol) framing over the child's stdio.
//!
//! Commands go out as single-line JSON objects on stdin; events and command
//! results come back as newline-delimited JSON objects on stdout. Only the
//! `event` field of incoming objects is acted upon.

use serde_json::{json, Value};
use tracing::debug;

/// Events the lifecycle controller reacts to. Anything else QEMU emits is
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QmpEvent {
    Reset,
    Powerdown,
    Shutdown,
    Stop,
    Resume,
}

/// One decoded line of QMP output.
#[derive(Debug, Clone, PartialEq)]
pub enum QmpMessage {
    Event(QmpEvent),
    /// Command returns, greetings and other non-event objects. Logged and
    /// discarded by the caller.
    Other(Value),
}

/// Encode `{"execute": cmd}` as a single line.
pub fn execute(cmd: &str) -> Vec<u8> {
    to_line(json!({ "execute": cmd }))
}

/// Encode `{"execute": cmd, "arguments": args}` as a single line.
pub fn execute_with_args(cmd: &str, args: Value) -> Vec<u8> {
    to_line(json!({ "execute": cmd, "arguments": args }))
}

/// Encode a human-monitor-command carrying `command_line`.
pub fn hmc(command_line: &str) -> Vec<u8> {
    execute_with_args("human-monitor-command", json!({ "command-line": command_line }))
}

/// Decode one line of QMP output.
///
/// Returns `None` for lines that are not valid JSON objects and for events
/// outside the recognised set; neither is an error.
pub fn decode(line: &str) -> Option<QmpMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(target: "qvmctl", "qmp: discarding unparseable line ({}): {}", err, line);
            return None;
        }
    };

    match value.get("event").and_then(Value::as_str) {
        Some(name) => match name {
            "RESET" => Some(QmpMessage::Event(QmpEvent::Reset)),
            "POWERDOWN" => Some(QmpMessage::Event(QmpEvent::Powerdown)),
            "SHUTDOWN" => Some(QmpMessage::Event(QmpEvent::Shutdown)),
            "STOP" => Some(QmpMessage::Event(QmpEvent::Stop)),
            "RESUME" => Some(QmpMessage::Event(QmpEvent::Resume)),
            other => {
                debug!(target: "qvmctl", "qmp: ignoring event {}", other);
                None
            }
        },
        None => Some(QmpMessage::Other(value)),
    }
}

fn to_line(value: Value) -> Vec<u8> {
    let mut line = value.to_string().into_bytes();
    line.push(b'\n');
    line
}
