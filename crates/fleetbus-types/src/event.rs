//! Hub lifecycle events.
//!
//! `HubEvent` is broadcast on the hub's event bus and mirrored to the message
//! bus as audit records (`topic = "hub.<name>"`).

use serde::{Deserialize, Serialize};

/// Which transport produced a hub event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Via {
    Http,
    Ws,
    Reaper,
}

/// Events emitted by the hub as agents come and go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// An agent registered (or re-registered).
    AgentRegistered {
        session_id: String,
        role: String,
        via: Via,
    },

    /// A heartbeat arrived for an unknown session and created its record.
    AgentAutoRegistered { session_id: String, via: Via },

    /// An agent reported a finished task.
    TaskComplete {
        session_id: String,
        task_id: String,
        result: serde_json::Value,
        via: Via,
    },

    /// A WebSocket association closed. The agent record is kept.
    AgentDisconnected { session_id: String, via: Via },

    /// The reaper removed an agent whose heartbeat went stale.
    AgentReaped {
        session_id: String,
        heartbeat_age_ms: u64,
    },
}

impl HubEvent {
    /// Event name used in audit topics (`hub.<name>`).
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::AgentRegistered { .. } => "agent_registered",
            HubEvent::AgentAutoRegistered { .. } => "agent_auto_registered",
            HubEvent::TaskComplete { .. } => "task_complete",
            HubEvent::AgentDisconnected { .. } => "agent_disconnected",
            HubEvent::AgentReaped { .. } => "agent_reaped",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            HubEvent::AgentRegistered { session_id, .. }
            | HubEvent::AgentAutoRegistered { session_id, .. }
            | HubEvent::TaskComplete { session_id, .. }
            | HubEvent::AgentDisconnected { session_id, .. }
            | HubEvent::AgentReaped { session_id, .. } => session_id,
        }
    }

    pub fn topic(&self) -> String {
        format!("hub.{}", self.name())
    }
}
