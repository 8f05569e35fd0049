//! Hub wire contract: HTTP bodies, WebSocket JSON frames, and the state file.
//!
//! Field names follow the hub's JSON contract (camelCase for agent-facing
//! identifiers, snake_case for hub-reported counters).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames an agent sends to the hub over `/api/connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Register {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        role: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Heartbeat {
        #[serde(default)]
        pressure: Option<serde_json::Value>,
        #[serde(default)]
        task_id: Option<String>,
    },
    AskPm {
        question: String,
        request_id: String,
        #[serde(default)]
        context: serde_json::Value,
    },
    TaskComplete {
        task_id: String,
        #[serde(default)]
        result: serde_json::Value,
    },
}

/// Frames the hub sends to an agent over `/api/connect`.
///
/// Pushed bus-style messages from `send_to_agent` are arbitrary JSON and do
/// not go through this enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome {
        pm_port: u16,
        connected_agents: usize,
    },
    Error {
        message: String,
    },
    Answer {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guidance: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// What the PM brain returns for a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmAnswer {
    pub guidance: String,
    /// Any further fields the brain wants to hand back verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PmAnswer {
    pub fn new(guidance: impl Into<String>) -> Self {
        Self {
            guidance: guidance.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// `POST /api/register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub connected: bool,
    pub agents_count: usize,
}

/// `POST /api/heartbeat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub pressure: Option<serde_json::Value>,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// `POST /api/ask-pm`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskPmRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// `POST /api/tasks/{id}/complete`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleteRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Error body returned by every failing hub endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Contents of the hub state file, written on start and removed on stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStateFile {
    pub port: u16,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}
