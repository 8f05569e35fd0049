//! Agent registry records held by the hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hub-owned record of one agent session.
///
/// Created on the first `register` or `heartbeat`, removed when reaped as
/// stale. A WebSocket association is tracked separately and never owns
/// this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub session_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Context/memory pressure as reported by the agent (opaque to the hub).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<serde_json::Value>,
}

impl AgentRecord {
    pub fn new(
        session_id: impl Into<String>,
        role: impl Into<String>,
        capabilities: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role: role.into(),
            capabilities,
            registered_at: now,
            last_heartbeat: now,
            task_id: None,
            pressure: None,
        }
    }

    /// Milliseconds since the last heartbeat (never negative).
    pub fn heartbeat_age_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.last_heartbeat).num_milliseconds()).unwrap_or(0)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after_ms: u64) -> bool {
        self.heartbeat_age_ms(now) > stale_after_ms
    }
}

/// One agent row of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub session_id: String,
    pub role: String,
    pub capabilities: Vec<String>,
    pub task_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_age_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<serde_json::Value>,
    /// Heartbeat older than the configured stale age.
    pub stale: bool,
    /// Whether a WebSocket push link is attached.
    #[serde(rename = "ws_connected")]
    pub ws_connected: bool,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubStatus {
    pub listening: bool,
    pub port: Option<u16>,
    /// Registered agents, linked or not.
    pub connected_agents: usize,
    pub agents: Vec<AgentStatus>,
    pub brain_available: bool,
}
