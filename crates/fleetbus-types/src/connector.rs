//! Agent-side connector types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EnvelopeDraft};

/// Which transport carried (or will carry) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    FileBus,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::FileBus => "file_bus",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "via", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(TransportKind),
}

/// Result of `connect()`.
///
/// `connected` is true only for the hub transport; falling back to the file
/// bus is a degraded mode, reported through `fallback`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOutcome {
    pub connected: bool,
    pub via: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<TransportKind>,
    /// Messages delivered to handlers by reconciliation during connect.
    pub reconciled: usize,
}

/// What an agent asks its connector to send.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Heartbeat {
        pressure: Option<serde_json::Value>,
        task_id: Option<String>,
    },
    AskPm {
        question: String,
        context: serde_json::Value,
    },
    TaskComplete {
        task_id: String,
        result: serde_json::Value,
    },
    /// A raw bus message. Over HTTP it is delivered to the PM as a bus line.
    Envelope(EnvelopeDraft),
}

impl Outbound {
    pub fn name(&self) -> &'static str {
        match self {
            Outbound::Heartbeat { .. } => "heartbeat",
            Outbound::AskPm { .. } => "ask_pm",
            Outbound::TaskComplete { .. } => "task_complete",
            Outbound::Envelope(_) => "envelope",
        }
    }
}

/// Result of `send()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReport {
    pub sent: bool,
    pub via: TransportKind,
    /// Hub response body or the appended bus envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

/// Something delivered to `on_message` handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A JSON frame pushed by the hub over the socket.
    Push(serde_json::Value),
    /// A bus envelope surfaced by reconciliation.
    Bus(Envelope),
}

impl Inbound {
    /// Message type: the frame's `type` field or the envelope kind.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Inbound::Push(value) => value.get("type").and_then(|t| t.as_str()),
            Inbound::Bus(envelope) => Some(envelope.kind.as_str()),
        }
    }
}
